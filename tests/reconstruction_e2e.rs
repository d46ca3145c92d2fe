//! End-to-end reconstruction of a simulated freehand sweep
//!
//! Frames every 33 ms and poses every 50 ms over three seconds, recorded
//! through a session, time-joined and reconstructed.

mod common;

use std::sync::Arc;

use common::mock_helpers::{MockRig, T0};
use nalgebra::Point3;
use usrecon_rs::config::{AssemblySettings, ReconstructionSettings};
use usrecon_rs::reconstruction::{
    CancellationToken, ReconstructInputData, ReconstructionInputAssembler, VolumeReconstructor,
};
use usrecon_rs::session::{AcquisitionSession, SessionState};

fn record_sweep(rig: &MockRig) -> Arc<AcquisitionSession> {
    let session = AcquisitionSession::new(1, Arc::new(rig.context()));
    session.start_record().unwrap();
    rig.run(3_000, 33, 50);
    session.stop_record().unwrap();
    session
}

fn assemble(session: &AcquisitionSession) -> ReconstructInputData {
    let (start, stop) = session.time_range().unwrap();
    let stream = &session.streams()[0];
    let track = session.positions().unwrap().track();
    ReconstructionInputAssembler::new(AssemblySettings::default())
        .assemble(
            stream.stream_id(),
            &stream.get_recording(start, stop),
            &track,
            session.probe_tool().as_ref(),
        )
        .unwrap()
}

#[test]
fn test_sweep_assembles_every_frame() {
    let rig = MockRig::new();
    let session = record_sweep(&rig);

    assert_eq!(session.time_range(), Some((T0, T0 + 3_000.0)));
    assert_eq!(session.streams()[0].sync_shift(), Some(T0));
    assert_eq!(session.positions().unwrap().len(), 61);

    let input = assemble(&session);
    assert_eq!(input.frames_total, 91);
    assert_eq!(input.len(), 91);
    assert_eq!(input.dropped.total(), 0);

    // Frames are ordered and every pose lies on the sweep
    for pair in input.frames.windows(2) {
        assert!(pair[0].timestamp < pair[1].timestamp);
    }
    for frame in &input.frames {
        let expected_z = (frame.timestamp - T0) / 100.0;
        common::assert_float_eq(frame.pose.translation().z, expected_z, 1e-6);
    }
}

#[test]
fn test_volume_bounds_match_frame_hull() {
    let rig = MockRig::new();
    let session = record_sweep(&rig);
    let input = assemble(&session);

    // Hull of the transformed frame corners, computed independently
    let mut lo = Point3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY);
    let mut hi = Point3::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
    for frame in &input.frames {
        let to_reference = frame.pose * input.calibration;
        for corner in frame.frame.corners() {
            let p = to_reference.transform_point(&corner);
            lo = lo.inf(&p);
            hi = hi.sup(&p);
        }
    }

    let spacing = 1.0;
    let reconstructor = VolumeReconstructor::new(ReconstructionSettings::default().with_spacing(spacing));
    let result = reconstructor
        .reconstruct(&input, &CancellationToken::new(), |_, _| {})
        .unwrap();

    let (min, max) = result.volume.geometry().bounds();
    for axis in 0..3 {
        assert!((min[axis] - lo[axis]).abs() <= spacing, "min axis {}", axis);
        assert!((max[axis] - hi[axis]).abs() <= spacing, "max axis {}", axis);
    }
    assert_eq!(result.frames_used, 91);
    assert!(result.voxels_filled > 0);
}

#[test]
fn test_masked_region_holds_frame_intensity() {
    let rig = MockRig::new();
    let session = record_sweep(&rig);
    let input = assemble(&session);

    let result = VolumeReconstructor::new(ReconstructionSettings::default().with_spacing(1.0))
        .reconstruct(&input, &CancellationToken::new(), |_, _| {})
        .unwrap();

    // Constant frames: every filled voxel averages to the pixel value
    let background = ReconstructionSettings::default().background;
    let filled: Vec<f32> = result
        .volume
        .data
        .iter()
        .copied()
        .filter(|v| *v != background)
        .collect();
    assert_eq!(filled.len(), result.voxels_filled);
    assert!(filled.iter().all(|v| (*v - 200.0).abs() < 1e-3));

    // The linear probe covers x in [8, 24] and y in [0, 16] only
    let volume = &result.volume;
    let (nx, ny, _) = volume.dimensions();
    let outside = volume.get(nx - 1, ny - 1, 0).unwrap();
    assert_eq!(outside, background);
}

#[test]
fn test_session_post_processing_completes() {
    let rig = MockRig::new();
    let session = record_sweep(&rig);

    let job = session
        .begin_post_processing(
            AssemblySettings::default(),
            ReconstructionSettings::default().with_spacing(2.0),
        )
        .unwrap();
    let summaries = job.run().unwrap();

    assert_eq!(session.state(), SessionState::Complete);
    assert_eq!(summaries[0].frames_used, 91);
    assert_eq!(summaries[0].spacing, 2.0);
    assert_eq!(session.result_count(), 1);
}
