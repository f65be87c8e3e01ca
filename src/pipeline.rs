//! Per-trial pipeline and the multi-trial batch runner.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use log::{error, info};

use crate::c3d;
use crate::config::ReconstructionConfig;
use crate::error::{Error, Result};
use crate::events;
use crate::kinematics;
use crate::model::Model;
use crate::segment;
use crate::trajectory;
use crate::trial::{Reconstruction, Trial};

/// Runs every stage on one trial.
///
/// Only the trajectory stage can fail (missing required markers); the
/// later stages record their problems as warnings.
pub fn reconstruct(trial: Trial, model: &Model, config: &ReconstructionConfig) -> Result<Reconstruction> {
    config.validate()?;
    let frame_count = trial.frame_count();
    let frame_rate = trial.frame_rate();

    let (trajectories, gap_warnings) = trajectory::process(&trial, &model.required_markers(), &config.gaps)?;
    let (poses, pose_warnings) = segment::fit(model.segments(), &trajectories, frame_count, &config.fit);
    let angles = kinematics::reconstruct(&poses, model.joints());
    let (events, event_warnings) =
        events::detect(model.limbs(), &trajectories, &poses, frame_rate, &config.events);

    let mut reconstruction = Reconstruction::new(trial);
    reconstruction.attach_trajectories(trajectories, gap_warnings);
    reconstruction.attach_poses(poses, pose_warnings);
    reconstruction.attach_angles(angles);
    reconstruction.attach_events(events, event_warnings);
    info!(
        "Reconstructed {} frames with {} warnings.",
        frame_count,
        reconstruction.diagnostics().len()
    );
    Ok(reconstruction)
}

/// Reads one capture file and reconstructs it.
pub fn process_file(path: &Path, model: &Model, config: &ReconstructionConfig) -> Result<Reconstruction> {
    let trial = c3d::read_file(path)?;
    reconstruct(trial, model, config)
}

/// The result for one file of a batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub path: PathBuf,
    pub result: Result<Reconstruction>,
}

/// Processes independent capture files on `workers` threads. Outcomes are
/// returned in the order of `paths`; a failing file only affects its own
/// outcome, even when its processing panics.
pub fn process_batch(
    paths: &[PathBuf],
    model: &Model,
    config: &ReconstructionConfig,
    workers: usize,
) -> Vec<BatchOutcome> {
    run_batch(paths, workers, |path| process_file(path, model, config))
}

fn run_batch<F>(paths: &[PathBuf], workers: usize, process: F) -> Vec<BatchOutcome>
where
    F: Fn(&Path) -> Result<Reconstruction> + Sync,
{
    let workers = workers.clamp(1, paths.len().max(1));
    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel();

    thread::scope(|s| {
        for _ in 0..workers {
            let tx = tx.clone();
            let next = &next;
            let process = &process;
            s.spawn(move || loop {
                let i = next.fetch_add(1, Ordering::SeqCst);
                let Some(path) = paths.get(i) else {
                    break;
                };
                let result = panic::catch_unwind(AssertUnwindSafe(|| process(path)))
                    .unwrap_or_else(|payload| Err(Error::Aborted(panic_message(payload))));
                if let Err(e) = &result {
                    error!("{}: {}", path.display(), e);
                }
                if tx.send((i, result)).is_err() {
                    break;
                }
            });
        }
    });
    drop(tx);

    let mut slots: Vec<Option<Result<Reconstruction>>> = paths.iter().map(|_| None).collect();
    for (i, result) in rx {
        slots[i] = Some(result);
    }
    paths
        .iter()
        .zip(slots)
        .filter_map(|(path, result)| {
            result.map(|result| BatchOutcome {
                path: path.clone(),
                result,
            })
        })
        .collect()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::TrialMetadata;

    #[test]
    fn invalid_config_is_rejected_before_work() {
        let trial = Trial::new(TrialMetadata::default(), 100.0, vec![], vec![]).unwrap();
        let model = Model::new(vec![], vec![], vec![]).unwrap();
        let mut config = ReconstructionConfig::default();
        config.fit.min_markers = 1;
        assert!(matches!(
            reconstruct(trial, &model, &config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn missing_files_fail_alone() {
        let model = Model::new(vec![], vec![], vec![]).unwrap();
        let paths = vec![
            PathBuf::from("does/not/exist-1.c3d"),
            PathBuf::from("does/not/exist-2.c3d"),
        ];
        let outcomes = process_batch(&paths, &model, &ReconstructionConfig::default(), 4);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[1].path, paths[1]);
        assert!(outcomes.iter().all(|o| matches!(o.result, Err(Error::Io(_)))));
    }

    #[test]
    fn panicking_trial_fails_alone() {
        let paths = vec![
            PathBuf::from("first.c3d"),
            PathBuf::from("broken.c3d"),
            PathBuf::from("third.c3d"),
        ];
        let outcomes = run_batch(&paths, 2, |path| {
            if path.ends_with("broken.c3d") {
                panic!("corrupt frame table");
            }
            let trial = Trial::new(TrialMetadata::default(), 100.0, vec![], vec![])?;
            Ok(Reconstruction::new(trial))
        });
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[2].result.is_ok());
        match &outcomes[1].result {
            Err(Error::Aborted(msg)) => assert_eq!(msg, "corrupt frame table"),
            other => panic!("expected an aborted trial, got {:?}", other),
        }
    }
}
