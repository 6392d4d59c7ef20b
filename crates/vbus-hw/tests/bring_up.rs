#![cfg(feature = "mock")]

use vbus_hw::mock::{DriverCall, MockDriver, MockFaults};
use vbus_hw::{
    BusError, BusKind, CanFrameType, HardwareFilter, InterfaceLifecycle, SlotState,
};

fn two_filters() -> Vec<HardwareFilter> {
    vec![
        HardwareFilter::new(vec![0x100, 0x200], 0x7FF, CanFrameType::Standard).unwrap(),
        HardwareFilter::new(vec![0x7DF], 0x7FF, CanFrameType::Extended).unwrap(),
    ]
}

#[test]
fn can_at_250_read_write_without_filters() -> anyhow::Result<()> {
    let driver = MockDriver::new();
    let mut lc = InterfaceLifecycle::new(driver.clone(), BusKind::Can);

    let mut handle = lc.bring_up(false, 250, None)?;

    assert_eq!(driver.count(|c| *c == DriverCall::SetBitrate(250)), 2);
    assert_eq!(driver.count(|c| *c == DriverCall::SetListeningMode(false)), 2);
    assert_eq!(driver.count(|c| *c == DriverCall::Create(false)), 1);
    assert_eq!(driver.count(|c| matches!(c, DriverCall::SetFilters(_))), 0);
    assert!(handle.is_live());
    assert_eq!(driver.live_interfaces(), 1);

    lc.teardown(&mut handle);
    assert_eq!(driver.live_interfaces(), 0);
    Ok(())
}

#[test]
fn rejected_second_filter_removes_interface_once() {
    let driver = MockDriver::with_faults(MockFaults {
        filter_at: Some(1),
        ..Default::default()
    });
    let mut lc = InterfaceLifecycle::new(driver.clone(), BusKind::Can);
    let filters = two_filters();

    let result = lc.bring_up(true, 250, Some(&filters));

    assert!(matches!(result, Err(BusError::FilterRejected(_))));
    assert_eq!(driver.count(|c| *c == DriverCall::Remove), 1);
    assert_eq!(driver.live_interfaces(), 0);
    assert_eq!(lc.slot(), SlotState::Absent);
}

#[test]
fn accepted_filters_are_kept_on_the_handle() -> anyhow::Result<()> {
    let driver = MockDriver::new();
    let mut lc = InterfaceLifecycle::new(driver.clone(), BusKind::Can);
    let filters = two_filters();

    let mut handle = lc.bring_up(true, 500, Some(&filters))?;

    assert_eq!(handle.filters(), &filters[..]);
    assert!(handle.listen_only());
    let calls = driver.calls();
    let filter_at = calls
        .iter()
        .position(|c| matches!(c, DriverCall::SetFilters(_)))
        .unwrap();
    let second_bitrate = calls
        .iter()
        .rposition(|c| *c == DriverCall::SetBitrate(500))
        .unwrap();
    assert!(filter_at > second_bitrate, "filters go on after the re-applied bitrate");
    assert_eq!(calls[filter_at], DriverCall::SetFilters(filters.clone()));

    lc.teardown(&mut handle);
    Ok(())
}

#[test]
fn empty_filter_list_is_still_installed() -> anyhow::Result<()> {
    let driver = MockDriver::new();
    let mut lc = InterfaceLifecycle::new(driver.clone(), BusKind::Can);
    let mut handle = lc.bring_up(false, 250, Some(&[]))?;
    assert_eq!(driver.count(|c| *c == DriverCall::SetFilters(vec![])), 1);
    lc.teardown(&mut handle);
    Ok(())
}

#[test]
fn bring_up_after_failure_starts_clean() -> anyhow::Result<()> {
    let driver = MockDriver::with_faults(MockFaults {
        create: true,
        ..Default::default()
    });
    let mut lc = InterfaceLifecycle::new(driver.clone(), BusKind::Can);
    assert!(matches!(
        lc.bring_up(true, 250, None),
        Err(BusError::CreateFailed { .. })
    ));

    driver.set_faults(MockFaults::default());
    let mut handle = lc.bring_up(true, 250, None)?;
    assert_eq!(lc.slot(), SlotState::Live { generation: 1 });
    lc.teardown(&mut handle);
    Ok(())
}
