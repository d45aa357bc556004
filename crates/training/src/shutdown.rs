use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::TrainingError;

/// Stop request shared between a signal handler and the epoch loop.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes Ctrl-C into this signal. Only one handler may be installed per
    /// process.
    ///
    /// ```no_run
    /// # use adversarial_training::{ShutdownSignal, TrainingError};
    /// let signal = ShutdownSignal::new();
    /// signal.install_ctrlc()?;
    /// // trainer.train_with_shutdown(|| signal.is_requested())?;
    /// # Ok::<(), TrainingError>(())
    /// ```
    pub fn install_ctrlc(&self) -> Result<(), TrainingError> {
        let flag = Arc::clone(&self.flag);
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::Relaxed);
        })
        .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
