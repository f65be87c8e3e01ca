#[cfg(test)]
mod tests {
    use std::f64::consts::PI;
    use std::path::PathBuf;

    use nalgebra::{Rotation3, Vector3};

    use gait::c3d::{self, Processor, Storage, WriteOptions};
    use gait::kinematics::{CardanSequence, JointConvention};
    use gait::model::{lower_body_definition, JointDefinition, LimbSignals};
    use gait::pipeline::process_batch;
    use gait::segment::SegmentTemplate;
    use gait::trajectory::{GapStatus, SampleStatus};
    use gait::{dist_3d, mean, standard_dev, variance};
    use gait::{
        Error, GaitEventKind, GapConfig, Limb, Marker, Model, Position, Reconstruction,
        ReconstructionConfig, Trial, TrialMetadata, Warning,
    };

    // =====================================================================
    // Synthetic walking trials.
    // =====================================================================

    const FRAMES: usize = 100;
    const RATE: f64 = 100.0;

    fn rx(a: f64) -> Rotation3<f64> {
	Rotation3::from_axis_angle(&Vector3::x_axis(), a)
    }

    fn xyz(a: [f64; 3]) -> Rotation3<f64> {
	CardanSequence::XYZ.compose(a)
    }

    fn segment_markers() -> Vec<(&'static str, Vec<(Marker, Position)>)> {
	vec![
	    ("Pelvis", vec![
		(Marker::Lpsi, Position::new(-50.0, -80.0, 0.0)),
		(Marker::Rpsi, Position::new(50.0, -80.0, 0.0)),
		(Marker::Lasi, Position::new(-120.0, 80.0, 0.0)),
		(Marker::Rasi, Position::new(120.0, 80.0, 0.0)),
	    ]),
	    ("LThigh", vec![
		(Marker::Lthi, Position::new(-50.0, 0.0, -150.0)),
		(Marker::Lthib, Position::new(-20.0, -40.0, -200.0)),
		(Marker::Lthid, Position::new(-40.0, 40.0, -260.0)),
	    ]),
	    ("LShank", vec![
		(Marker::Ltib, Position::new(-45.0, 0.0, -150.0)),
		(Marker::Ltibf, Position::new(0.0, 40.0, -100.0)),
		(Marker::Ltibd, Position::new(-30.0, 20.0, -250.0)),
	    ]),
	    ("LFoot", vec![
		(Marker::Lhee, Position::new(0.0, -60.0, -20.0)),
		(Marker::Lnav, Position::new(20.0, 40.0, -10.0)),
		(Marker::Ltoe, Position::new(0.0, 140.0, -20.0)),
		(Marker::Ltoe5, Position::new(-50.0, 120.0, -25.0)),
	    ]),
	]
    }

    /// Relative rotations (radians) of thigh, shank and foot at a frame.
    fn joint_rotations(frame: usize) -> [[f64; 3]; 3] {
	let w = 2.0 * PI * frame as f64 / RATE;
	[
	    [0.5 * w.sin(), 0.1 * w.cos(), 0.05 * w.sin()],
	    [-0.6 * (1.0 - w.cos()), 0.05 * w.sin(), -0.1 * w.cos()],
	    [0.2 * w.sin(), -0.08 * w.cos(), 0.15 * w.sin()],
	]
    }

    /// Global pose of each segment (pelvis, thigh, shank, foot).
    fn segment_poses(frame: usize) -> Vec<(Rotation3<f64>, Vector3<f64>)> {
	let t = frame as f64 / RATE;
	let pelvis = Rotation3::from_axis_angle(&Vector3::z_axis(), 0.2 * (2.0 * PI * t).sin());
	let mut poses = vec![(pelvis, Vector3::new(0.0, 1000.0 * t, 950.0))];
	let offsets = [
	    Vector3::new(-100.0, 0.0, 0.0),
	    Vector3::new(0.0, 0.0, -400.0),
	    Vector3::new(0.0, 0.0, -420.0),
	];
	for (rel, offset) in joint_rotations(frame).iter().zip(offsets) {
	    let (r, p) = poses[poses.len() - 1];
	    poses.push((r * xyz(*rel), p + r * offset));
	}
	poses
    }

    fn labels() -> Vec<String> {
	segment_markers()
	    .iter()
	    .flat_map(|(_, m)| m.iter().map(|(marker, _)| marker.to_string()))
	    .collect()
    }

    /// Four-segment leg walking forward; `hide` lists (marker, first frame,
    /// last frame) occlusions.
    fn leg_trial(hide: &[(Marker, usize, usize)]) -> Trial {
	let rows = (0..FRAMES)
	    .map(|f| {
		let poses = segment_poses(f);
		segment_markers()
		    .iter()
		    .zip(poses)
		    .flat_map(|((_, markers), (r, t))| {
			markers
			    .iter()
			    .map(|(m, local)| {
				let hidden = hide.iter().any(|(h, s, e)| h == m && f >= *s && f <= *e);
				if hidden { None } else { Some(r * local + t) }
			    })
			    .collect::<Vec<_>>()
		    })
		    .collect()
	    })
	    .collect();
	let metadata = TrialMetadata {
	    subject_id: Some("synthetic".to_string()),
	    first_frame: 1,
	    ..Default::default()
	};
	Trial::new(metadata, RATE, labels(), rows).unwrap()
    }

    fn leg_model(foot_markers: Option<Vec<(Marker, Position)>>) -> Model {
	let mut templates: Vec<SegmentTemplate> = segment_markers()
	    .into_iter()
	    .map(|(name, markers)| SegmentTemplate::new(name, markers).unwrap())
	    .collect();
	if let Some(foot) = foot_markers {
	    templates[3] = SegmentTemplate::new("LFoot", foot).unwrap();
	}
	let joint = |name: &str, parent: &str, child: &str| JointDefinition {
	    name: name.to_string(),
	    parent: parent.to_string(),
	    child: child.to_string(),
	    convention: JointConvention::raw(CardanSequence::XYZ),
	};
	let joints = vec![
	    joint("LHip", "Pelvis", "LThigh"),
	    joint("LKnee", "LThigh", "LShank"),
	    joint("LAnkle", "LShank", "LFoot"),
	];
	let limbs = vec![LimbSignals {
	    limb: Limb::Left,
	    heel: Marker::Lhee,
	    foot: Some("LFoot".to_string()),
	}];
	Model::new(templates, joints, limbs).unwrap()
    }

    fn reconstruct(trial: Trial, config: &ReconstructionConfig) -> gait::Result<Reconstruction> {
	gait::reconstruct(trial, &leg_model(None), config)
    }

    fn temp_path(name: &str) -> PathBuf {
	let dir = std::env::temp_dir().join(format!("gait-tests-{}", std::process::id()));
	std::fs::create_dir_all(&dir).unwrap();
	dir.join(name)
    }

    /// Properties that must hold for every reconstruction.
    fn check_invariants(rec: &Reconstruction, max_fill_gap: usize) {
	for t in rec.trajectories().unwrap().trajectories() {
	    for s in t.samples() {
		assert!(s.position.is_none() == (s.status == SampleStatus::Gap));
	    }
	    for gap in t.gaps() {
		if gap.status == GapStatus::Interpolated {
		    assert!(gap.len() <= max_fill_gap);
		}
	    }
	}
	for series in rec.poses().unwrap().series() {
	    for pose in series.poses().iter().flatten() {
		let m = pose.rotation.matrix();
		assert!((m.transpose() * m - nalgebra::Matrix3::identity()).norm() < 1e-6);
		assert!((m.determinant() - 1.0).abs() < 1e-6);
	    }
	}
	for limb in rec.events().unwrap().limbs() {
	    for pair in limb.events.windows(2) {
		assert!(pair[0].kind != pair[1].kind);
		assert!(pair[0].timestamp < pair[1].timestamp);
	    }
	}
    }

    // =====================================================================
    // Scenarios.
    // =====================================================================

    #[test]
    fn all_visible_gives_analytic_angles() {
	let config = ReconstructionConfig::default();
	let rec = reconstruct(leg_trial(&[]), &config).unwrap();
	check_invariants(&rec, config.gaps.max_fill_gap);

	for series in rec.poses().unwrap().series() {
	    assert!(series.unresolved_count() == 0);
	}
	let angles = rec.angles().unwrap();
	for (j, name) in ["LHip", "LKnee", "LAnkle"].iter().enumerate() {
	    let series = angles.joint(name).unwrap();
	    for f in 0..FRAMES {
		let expected = joint_rotations(f)[j];
		let got = series.angle(f).unwrap();
		for k in 0..3 {
		    assert!((got[k] - expected[k].to_degrees()).abs() < 1e-6, "{} frame {}", name, f);
		}
	    }
	}
	assert!(!rec
	    .diagnostics()
	    .iter()
	    .any(|w| matches!(w, Warning::UnresolvedPose { .. } | Warning::LowConfidenceFit { .. })));
    }

    #[test]
    fn short_gap_is_interpolated_and_pose_resolved() {
	let config = ReconstructionConfig::default();
	let rec = reconstruct(leg_trial(&[(Marker::Lthi, 40, 44)]), &config).unwrap();
	check_invariants(&rec, config.gaps.max_fill_gap);

	let lthi = rec.trajectories().unwrap().marker(Marker::Lthi).unwrap();
	assert!(lthi.gaps().len() == 1);
	assert!(lthi.gaps()[0].status == GapStatus::Interpolated);
	for f in 40..=44 {
	    assert!(lthi.is_interpolated(f));
	    let pose = rec.poses().unwrap().segment("LThigh").unwrap().pose(f).unwrap();
	    assert!(pose.interpolated_used == 1);
	}
	assert!(!lthi.is_interpolated(39) && !lthi.is_interpolated(45));
	assert!(rec.poses().unwrap().segment("LThigh").unwrap().unresolved_count() == 0);
    }

    #[test]
    fn long_gap_in_required_marker_fails_trial() {
	let result = reconstruct(leg_trial(&[(Marker::Ltib, 20, 69)]), &ReconstructionConfig::default());
	match result {
	    Err(Error::InsufficientData { marker, unresolved, total }) => {
		assert!(marker == "LTIB");
		assert!(unresolved == 50);
		assert!(total == FRAMES);
	    }
	    other => panic!("expected InsufficientData, got {:?}", other.map(|_| ())),
	}
    }

    #[test]
    fn unresolved_pose_propagates_to_joints() {
	let config = ReconstructionConfig {
	    gaps: GapConfig { max_fill_gap: 3, ..Default::default() },
	    ..Default::default()
	};
	let trial = leg_trial(&[(Marker::Ltib, 60, 67), (Marker::Ltibf, 60, 67)]);
	let rec = reconstruct(trial, &config).unwrap();
	check_invariants(&rec, 3);

	let shank = rec.poses().unwrap().segment("LShank").unwrap();
	assert!(shank.unresolved_count() == 8);
	let angles = rec.angles().unwrap();
	for f in 60..=67 {
	    assert!(shank.pose(f).is_none());
	    assert!(angles.joint("LKnee").unwrap().angle(f).is_none());
	    assert!(angles.joint("LAnkle").unwrap().angle(f).is_none());
	    assert!(angles.joint("LHip").unwrap().angle(f).is_some());
	}
	assert!(angles.joint("LKnee").unwrap().angle(68).is_some());
	assert!(rec.diagnostics().iter().any(|w| matches!(
	    w,
	    Warning::UnresolvedPose { segment, start: 60, end: 67, .. } if segment == "LShank"
	)));
	assert!(rec.diagnostics().iter().any(|w| matches!(
	    w,
	    Warning::UnresolvedGap { marker, start: 60, end: 67 } if marker == "LTIB"
	)));
    }

    #[test]
    fn poorly_tracked_heel_falls_back_to_foot() {
	// The heel is not part of the foot cluster here, and drops out for most of the trial.
	let foot: Vec<(Marker, Position)> = segment_markers()[3].1[1..].to_vec();
	let model = leg_model(Some(foot));
	let trial = leg_trial(&[(Marker::Lhee, 10, 80)]);
	let rec = gait::reconstruct(trial, &model, &ReconstructionConfig::default()).unwrap();
	check_invariants(&rec, 10);

	let left = rec.events().unwrap().limb(Limb::Left).unwrap();
	assert!(left.source == "LFoot segment");
	assert!(rec.diagnostics().contains(&Warning::EventSignalFallback {
	    limb: Limb::Left,
	    source: "LFoot segment".to_string(),
	}));
    }

    // =====================================================================
    // Calibrated lower-body model.
    // =====================================================================

    /// Neutral standing posture, facing +Y with Z up. Every segment frame is
    /// aligned with the laboratory (the foot's Z points backwards).
    fn standing() -> Vec<(Marker, Position)> {
	use Marker::*;
	let left = vec![
	    (Lasi, Position::new(-120.0, 80.0, 1000.0)),
	    (Lpsi, Position::new(-50.0, -80.0, 1000.0)),
	    (Lthi, Position::new(-170.0, 80.0, 760.0)),
	    (Lthib, Position::new(-140.0, 40.0, 700.0)),
	    (Lthid, Position::new(-160.0, 120.0, 640.0)),
	    (Lknee, Position::new(-170.0, 80.0, 520.0)),
	    (Lkneem, Position::new(-70.0, 80.0, 520.0)),
	    (Ltib, Position::new(-165.0, 80.0, 300.0)),
	    (Ltibf, Position::new(-120.0, 120.0, 350.0)),
	    (Ltibd, Position::new(-150.0, 100.0, 200.0)),
	    (Lank, Position::new(-160.0, 80.0, 80.0)),
	    (Lankm, Position::new(-80.0, 80.0, 80.0)),
	    (Lhee, Position::new(-120.0, 20.0, 60.0)),
	    (Lnav, Position::new(-100.0, 120.0, 70.0)),
	    (Ltoe, Position::new(-120.0, 220.0, 60.0)),
	    (Ltoe5, Position::new(-170.0, 200.0, 55.0)),
	];
	let right = [
	    Rasi, Rpsi, Rthi, Rthib, Rthid, Rknee, Rkneem, Rtib, Rtibf, Rtibd, Rank, Rankm, Rhee,
	    Rnav, Rtoe, Rtoe5,
	];
	let mut markers: Vec<(Marker, Position)> = right
	    .iter()
	    .zip(&left)
	    .map(|(r, (_, p))| (*r, Position::new(-p.x, p.y, p.z)))
	    .collect();
	markers.extend(left);
	markers.extend([
	    (C7, Position::new(0.0, -60.0, 1450.0)),
	    (C2, Position::new(10.0, -40.0, 1550.0)),
	    (T6, Position::new(-10.0, -90.0, 1300.0)),
	    (T10, Position::new(0.0, -80.0, 1200.0)),
	    (S1, Position::new(0.0, -95.0, 1050.0)),
	    (S3, Position::new(5.0, -90.0, 1020.0)),
	    (Clav, Position::new(0.0, 60.0, 1450.0)),
	    (Strn, Position::new(0.0, 80.0, 1200.0)),
	]);
	markers
    }

    /// The standing posture carried along a walkway with some yaw, the left
    /// shank and foot flexed about the knee by `knee(frame)` radians.
    fn moving_trial(knee: impl Fn(usize) -> f64) -> Trial {
	use Marker::*;
	let base = standing();
	let knee_centre = Position::new(-120.0, 80.0, 520.0);
	let below_knee = [Ltib, Ltibf, Ltibd, Lank, Lankm, Lhee, Lnav, Ltoe, Ltoe5];
	let rows = (0..FRAMES)
	    .map(|f| {
		let w = 2.0 * PI * f as f64 / RATE;
		let body = Rotation3::from_axis_angle(&Vector3::z_axis(), 0.3 * w.sin());
		let shift = Vector3::new(0.0, 12.0 * f as f64, 5.0 * w.cos());
		let flex = rx(-knee(f));
		base.iter()
		    .map(|(m, p)| {
			let local = if below_knee.contains(m) {
			    knee_centre + flex * (p - knee_centre)
			} else {
			    *p
			};
			Some(body * local + shift)
		    })
		    .collect()
	    })
	    .collect();
	let labels = base.iter().map(|(m, _)| format!("pilot:{}", m)).collect();
	Trial::new(TrialMetadata::default(), RATE, labels, rows).unwrap()
    }

    fn static_trial() -> Trial {
	let base = standing();
	let labels = base.iter().map(|(m, _)| m.to_string()).collect();
	let row: Vec<Option<Position>> = base.iter().map(|(_, p)| Some(*p)).collect();
	Trial::new(TrialMetadata::default(), RATE, labels, vec![row; 10]).unwrap()
    }

    #[test]
    fn neutral_posture_gives_zero_angles() {
	let model = Model::calibrate(&lower_body_definition(), &static_trial()).unwrap();
	let rec = gait::reconstruct(moving_trial(|_| 0.0), &model, &ReconstructionConfig::default()).unwrap();
	check_invariants(&rec, 10);
	let angles = rec.angles().unwrap();
	assert!(angles.series().len() == 7);
	for series in angles.series() {
	    for sample in series.samples() {
		let a = sample.unwrap();
		for k in 0..3 {
		    assert!(a[k].abs() < 1e-6, "{} {:?}", series.joint, a);
		}
	    }
	}
    }

    #[test]
    fn knee_flexion_is_reported_positive() {
	let model = Model::calibrate(&lower_body_definition(), &static_trial()).unwrap();
	let knee = |f: usize| (20.0 + 20.0 * (2.0 * PI * f as f64 / RATE).sin()).to_radians();
	let rec = gait::reconstruct(moving_trial(knee), &model, &ReconstructionConfig::default()).unwrap();
	let angles = rec.angles().unwrap();
	for f in 0..FRAMES {
	    let lknee = angles.joint("LKnee").unwrap().angle(f).unwrap();
	    assert!((lknee[0] - knee(f).to_degrees()).abs() < 1e-6);
	    assert!(lknee[1].abs() < 1e-6 && lknee[2].abs() < 1e-6);
	    let lankle = angles.joint("LAnkle").unwrap().angle(f).unwrap();
	    assert!(lankle[0].abs() < 1e-6);
	    let rknee = angles.joint("RKnee").unwrap().angle(f).unwrap();
	    assert!(rknee[0].abs() < 1e-6);
	}
	assert!(angles.joint("LKnee").unwrap().components[0] == "flexion");
    }

    // =====================================================================
    // Files and batches.
    // =====================================================================

    #[test]
    fn file_round_trip_keeps_positions() {
	let original = leg_trial(&[(Marker::Ltoe, 10, 12)]);
	let options = [
	    (WriteOptions::default(), 1e-3),
	    (WriteOptions { processor: Processor::Dec, storage: Storage::Integer { scale: 0.1 }, ..Default::default() }, 0.1),
	    (WriteOptions { processor: Processor::Mips, ..Default::default() }, 1e-3),
	];
	for (n, (opts, tol)) in options.iter().enumerate() {
	    let path = temp_path(&format!("round_trip_{}.c3d", n));
	    c3d::write_file(&original, &path, opts).unwrap();
	    let decoded = c3d::read_file(&path).unwrap();
	    assert!(decoded.metadata.trial_id == Some(format!("round_trip_{}", n)));
	    assert!(decoded.metadata.subject_id == Some("synthetic".to_string()));
	    assert!(decoded.labels() == original.labels());
	    assert!(decoded.frame_count() == original.frame_count());
	    for (a, b) in original.frames().iter().zip(decoded.frames()) {
		for (pa, pb) in a.positions().iter().zip(b.positions()) {
		    match (pa, pb) {
			(Some(pa), Some(pb)) => assert!(dist_3d(pa.as_slice(), pb.as_slice()) <= *tol),
			(None, None) => {}
			_ => panic!("gap mismatch at frame {}", a.index),
		    }
		}
	    }
	    let info = c3d::inspect(&path).unwrap();
	    assert!(info.header.first_frame == 1);
	    std::fs::remove_file(&path).unwrap();
	}
    }

    #[test]
    fn batch_failures_stay_isolated() {
	let good = temp_path("batch_good.c3d");
	let bad = temp_path("batch_bad.c3d");
	c3d::write_file(&leg_trial(&[]), &good, &WriteOptions::default()).unwrap();
	c3d::write_file(&leg_trial(&[(Marker::Lthib, 0, 49)]), &bad, &WriteOptions::default()).unwrap();
	let missing = temp_path("batch_missing.c3d");
	let paths = vec![bad.clone(), good.clone(), missing.clone()];

	let outcomes = process_batch(&paths, &leg_model(None), &ReconstructionConfig::default(), 3);
	assert!(outcomes.len() == 3);
	assert!(outcomes.iter().map(|o| o.path.clone()).collect::<Vec<_>>() == paths);
	assert!(matches!(outcomes[0].result, Err(Error::InsufficientData { .. })));
	assert!(matches!(outcomes[2].result, Err(Error::Io(_))));
	let rec = outcomes[1].result.as_ref().unwrap();
	assert!(rec.poses().unwrap().series().iter().all(|s| s.unresolved_count() == 0));
	assert!(rec.trial().metadata.trial_id == Some("batch_good".to_string()));

	std::fs::remove_file(&good).unwrap();
	std::fs::remove_file(&bad).unwrap();
    }

    #[test]
    fn corrupt_frame_count_fails_alone() {
	let good = temp_path("corrupt_good.c3d");
	let bad = temp_path("corrupt_bad.c3d");
	c3d::write_file(&leg_trial(&[]), &good, &WriteOptions::default()).unwrap();
	let mut bytes = c3d::encode(&leg_trial(&[]), &WriteOptions::default()).unwrap();
	// Clipped header last frame defers to POINT:FRAMES, which is far too large.
	bytes[8..10].copy_from_slice(&65535u16.to_le_bytes());
	let pos = bytes.windows(6).position(|w| w == b"FRAMES").unwrap();
	let value_at = pos + 6 + 2 + 2;
	bytes[value_at..value_at + 2].copy_from_slice(&32767i16.to_le_bytes());
	std::fs::write(&bad, &bytes).unwrap();
	let paths = vec![bad.clone(), good.clone()];

	let outcomes = process_batch(&paths, &leg_model(None), &ReconstructionConfig::default(), 2);
	assert!(outcomes.len() == 2);
	assert!(matches!(outcomes[0].result, Err(Error::MalformedCapture(_))));
	assert!(outcomes[1].result.is_ok());

	std::fs::remove_file(&good).unwrap();
	std::fs::remove_file(&bad).unwrap();
    }

    #[test]
    fn events_alternate_per_limb() {
	let rec = reconstruct(leg_trial(&[]), &ReconstructionConfig::default()).unwrap();
	let events = rec.events().unwrap();
	let left = events.limb(Limb::Left).unwrap();
	assert!(left.source == "LHEE");
	let all = events.all();
	assert!(all.len() == left.events.len());
	for pair in all.windows(2) {
	    assert!(pair[0].kind != pair[1].kind);
	}
	assert!(all
	    .iter()
	    .all(|e| e.kind == GaitEventKind::HeelStrike || e.kind == GaitEventKind::ToeOff));
    }

    // =====================================================================
    // Small helpers.
    // =====================================================================

    #[test]
    fn test_zero_dist() {
	let dist = dist_3d(&[0.0,0.0,0.0], &[0.0,0.0,0.0]);
	assert!(dist==0.0);
    }

    #[test]
    fn test_normal_dist() {
	let dist = dist_3d(&[3.0,4.0,0.0], &[0.0,0.0,0.0]);
	assert!(dist==5.0);
    }

    #[test]
    #[should_panic]
    fn test_wrong_params_lhs() {
	let _dist = dist_3d(&[1.0,0.0,0.0,4.0], &[0.0,0.0,0.0]);
    }

    #[test]
    fn test_dist_wrong_params_rhs() {
	let result = std::panic::catch_unwind(|| dist_3d(&[1.0,0.0,0.0], &[0.0,0.0,0.0,4.0]));
	assert!(result.is_err());
    }

    #[test]
    fn test_stats() {
	let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
	assert!(mean(&values) == 5.0);
	assert!(variance(&values) == 4.0);
	assert!(standard_dev(&values) == 2.0);
	assert!(mean(&[]) == 0.0);
    }
}
