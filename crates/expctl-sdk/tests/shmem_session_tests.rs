//! 共享内存传输上的会话集成测试
//!
//! 试验端由进程内的 `RigEmulator` 扮演。

use expctl_sdk::prelude::*;
use expctl_sdk::transport::shmem::emulator::{EmulatorConfig, RigEmulator, RigEvent};
use expctl_sdk::transport::shmem::{Flag, HeapRegion, SharedRegion};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn config(num_dof: usize) -> SharedMemoryConfig {
    SharedMemoryConfig {
        node_id: 0,
        timeout: Some(Duration::from_secs(5)),
        ..SharedMemoryConfig::new(num_dof)
    }
}

fn region_for(config: &SharedMemoryConfig) -> Arc<HeapRegion> {
    Arc::new(HeapRegion::new(config.layout().unwrap().end_word()))
}

fn session_on(
    region: &Arc<HeapRegion>,
    config: SharedMemoryConfig,
) -> ControlSession<SharedMemoryTransport> {
    let shared: Arc<dyn SharedRegion> = region.clone();
    let num_dof = config.num_dof;
    let transport = SharedMemoryTransport::new(shared, config).unwrap();
    ControlSession::new(transport, SizeSpec::for_dof(num_dof))
}

fn trial(disp: Vec<f64>, time: f64) -> TrialResponse {
    let n = disp.len();
    TrialResponse::new(disp, vec![0.0; n], vec![0.0; n], vec![time])
}

fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-5, "{:?} != {:?}", actual, expected);
    }
}

/// 仿真端必须等到 atTarget 才回读
#[test]
fn test_handshake_waits_for_at_target() {
    let config = config(2);
    let layout = config.layout().unwrap();
    let region = region_for(&config);
    let delay = Duration::from_millis(50);
    let rig = RigEmulator::spawn(
        region.clone(),
        layout,
        EmulatorConfig {
            at_target_delay: delay,
            stiffness: 10.0,
            ..EmulatorConfig::default()
        },
    );

    let mut session = session_on(&region, config);
    session.setup().unwrap();

    let start = Instant::now();
    session.set_trial_response(&trial(vec![0.5, -0.25], 1.0)).unwrap();
    let daq = session.get_daq_response().unwrap();
    assert!(start.elapsed() >= delay);

    assert_close(&daq.disp, &[0.5, -0.25]);
    assert_close(&daq.force, &[5.0, -2.5]);
    assert_close(&daq.time, &[1.0]);
    session.commit_state().unwrap();

    // release 之后标志全部归零
    for flag in Flag::ALL {
        assert_eq!(region.load(layout.flag(flag)).unwrap(), 0);
    }

    session.close().unwrap();
    let events = rig.stop();
    assert_eq!(
        events,
        vec![
            RigEvent::TargetSeen,
            RigEvent::SwitchPcRaised,
            RigEvent::TargetApplied,
            RigEvent::AtTargetRaised,
        ]
    );
}

#[test]
fn test_many_steps() {
    let config = config(1);
    let region = region_for(&config);
    let rig = RigEmulator::spawn(
        region.clone(),
        config.layout().unwrap(),
        EmulatorConfig {
            stiffness: 2.0,
            ..EmulatorConfig::default()
        },
    );

    let mut session = session_on(&region, config);
    session.setup().unwrap();
    for step in 1..=20 {
        let d = step as f64 * 0.125;
        session.set_trial_response(&trial(vec![d], step as f64)).unwrap();
        let daq = session.get_daq_response().unwrap();
        assert_close(&daq.force, &[2.0 * d]);
        session.commit_state().unwrap();
    }
    assert_eq!(rig.steps(), 20);
    session.close().unwrap();
}

/// 首个试验响应作为零点，测量力扣除初始力
#[test]
fn test_relative_trial_offsets() {
    let config = config(1);
    let region = region_for(&config);
    let rig = RigEmulator::spawn(
        region.clone(),
        config.layout().unwrap(),
        EmulatorConfig {
            stiffness: 100.0,
            force_bias: 5.0,
            ..EmulatorConfig::default()
        },
    );

    let mut session = session_on(&region, config).with_relative_trial(true);
    session.setup().unwrap();

    session.set_trial_response(&trial(vec![0.2], 1.0)).unwrap();
    let state = session.offset_state().clone();
    assert!(state.got_relative_trial);
    assert_close(&state.trial_disp_offset, &[0.2]);
    assert_close(&state.trial_force_offset, &[5.0]);

    let daq = session.get_daq_response().unwrap();
    assert_close(&daq.disp, &[0.2]);
    assert_close(&daq.force, &[0.0]);
    session.commit_state().unwrap();

    session.set_trial_response(&trial(vec![0.7], 2.0)).unwrap();
    let daq = session.get_daq_response().unwrap();
    assert_close(&daq.disp, &[0.7]);
    assert_close(&daq.force, &[50.0]);

    // 偏移只在第一步捕获一次
    assert_close(&session.offset_state().trial_disp_offset, &[0.2]);
    session.close().unwrap();
    assert_eq!(rig.steps(), 2);
}

#[test]
fn test_interrupt_driven_session() {
    let config = config(3);
    let region = region_for(&config);
    let interrupts = region.subscribe();
    let rig = RigEmulator::spawn(
        region.clone(),
        config.layout().unwrap(),
        EmulatorConfig {
            at_target_delay: Duration::from_millis(5),
            ..EmulatorConfig::default()
        },
    );

    let mut session = SessionBuilder::new()
        .num_dof(3)
        .shared_region(region.clone(), config)
        .interrupts(interrupts)
        .build()
        .unwrap();
    session.setup().unwrap();
    for step in 0..5 {
        let disp = vec![step as f64, 1.0, -1.0];
        session.set_trial_response(&trial(disp.clone(), step as f64)).unwrap();
        assert_close(&session.get_daq_response().unwrap().force, &disp);
        session.commit_state().unwrap();
    }
    session.close().unwrap();
    assert_eq!(rig.steps(), 5);
}

#[test]
fn test_close_idles_region() {
    let config = config(2);
    let layout = config.layout().unwrap();
    let region = region_for(&config);
    let rig = RigEmulator::spawn(region.clone(), layout, EmulatorConfig::default());

    let mut session = session_on(&region, config);
    session.setup().unwrap();
    session.set_trial_response(&trial(vec![1.0, 2.0], 1.0)).unwrap();
    session.get_daq_response().unwrap();
    drop(rig);

    session.close().unwrap();
    assert!(matches!(session.close(), Err(SessionError::SessionClosed)));
    for flag in Flag::ALL {
        assert_eq!(region.load(layout.flag(flag)).unwrap(), 0);
    }
    for index in layout.outbound() {
        assert_eq!(region.load(index).unwrap(), 0);
    }
}

/// 没有试验端应答时超时，会话关闭
#[test]
fn test_missing_rig_times_out() {
    let config = SharedMemoryConfig {
        timeout: Some(Duration::from_millis(20)),
        ..config(1)
    };
    let region = region_for(&config);
    let mut session = session_on(&region, config);
    session.setup().unwrap();

    let err = session.set_trial_response(&trial(vec![0.1], 1.0)).unwrap_err();
    assert!(matches!(
        err,
        SessionError::TransportIo(TransportError::Timeout)
    ));
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn test_size_outside_layout_rejected() {
    let config = config(2);
    let region = region_for(&config);
    let shared: Arc<dyn SharedRegion> = region.clone();
    let transport = SharedMemoryTransport::new(shared, config).unwrap();
    let mut session = ControlSession::new(transport, SizeSpec::for_dof(3));

    assert!(matches!(
        session.setup(),
        Err(SessionError::SizeMismatch { .. })
    ));
    assert_eq!(session.state(), SessionState::Unconfigured);
}
