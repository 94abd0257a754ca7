use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{refine, CalibrationSample, IronCorrection, RefinementReport};
use crate::config::CalibrationConfig;
use crate::sensors::GeomagneticReference;

pub(crate) enum WorkerPoll {
    Pending,
    Finished(RefinementReport),
    /// The worker exited without reporting
    Lost,
}

/// One background refinement run, owned by the calibrator until its report is taken
pub(crate) struct RefinementWorker {
    from_worker_rx: mpsc::Receiver<RefinementReport>,
    worker_thread: Option<JoinHandle<()>>,
}

impl RefinementWorker {
    pub(crate) fn spawn(
        samples: Vec<CalibrationSample>,
        initial: IronCorrection,
        reference: GeomagneticReference,
        config: CalibrationConfig,
    ) -> Self {
        let (to_caller_tx, from_worker_rx) = mpsc::channel();
        let worker_thread = std::thread::spawn(move || {
            let report = refine::run(&samples, &initial, &reference, &config);
            // The calibrator may have been reset meanwhile; nobody is listening then
            let _ = to_caller_tx.send(report);
        });
        Self {
            from_worker_rx,
            worker_thread: Some(worker_thread),
        }
    }

    pub(crate) fn poll(&mut self) -> WorkerPoll {
        match self.from_worker_rx.try_recv() {
            Ok(report) => self.finish(report),
            Err(mpsc::TryRecvError::Empty) => WorkerPoll::Pending,
            Err(mpsc::TryRecvError::Disconnected) => WorkerPoll::Lost,
        }
    }

    pub(crate) fn wait(&mut self, timeout: Duration) -> WorkerPoll {
        match self.from_worker_rx.recv_timeout(timeout) {
            Ok(report) => self.finish(report),
            Err(mpsc::RecvTimeoutError::Timeout) => WorkerPoll::Pending,
            Err(mpsc::RecvTimeoutError::Disconnected) => WorkerPoll::Lost,
        }
    }

    fn finish(&mut self, report: RefinementReport) -> WorkerPoll {
        if let Some(handle) = self.worker_thread.take() {
            // Report already sent, so the thread is exiting
            let _ = handle.join();
        }
        WorkerPoll::Finished(report)
    }
}

impl std::fmt::Debug for RefinementWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefinementWorker")
            .field("running", &self.worker_thread.is_some())
            .finish()
    }
}
