//! Engine context shared by every sequence: the platform and the dispatch
//! queue. Firmware installs one process-wide instance at boot with [`init`];
//! tests build private ones with [`Dio::new`].

use std::sync::{Arc, OnceLock};

use log::info;

use crate::dio_task::{self, DioQueue};
use crate::error::{DioError, Result};
use crate::gpio::Platform;

#[derive(Clone)]
pub struct Dio {
    platform: Arc<dyn Platform>,
    queue: Arc<DioQueue>,
}

impl Dio {
    /// Engine with a queue rung by the platform's doorbell.
    pub fn new(platform: Arc<dyn Platform>) -> Result<Self> {
        let doorbell = platform.doorbell()?;
        Ok(Self::with_queue(platform, Arc::new(DioQueue::new(doorbell))))
    }

    pub fn with_queue(platform: Arc<dyn Platform>, queue: Arc<DioQueue>) -> Self {
        Self { platform, queue }
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn queue(&self) -> &Arc<DioQueue> {
        &self.queue
    }

    /// Drain the dispatch queue on the calling context.
    pub fn run_pending(&self) -> usize {
        self.queue.run_pending()
    }

    /// Start the `dio_task` worker for this engine's queue.
    pub fn spawn_task(&self) -> Result<std::thread::JoinHandle<()>> {
        dio_task::spawn(self.queue.clone()).map_err(|err| DioError::Platform(err.to_string()))
    }
}

static DIO: OnceLock<Dio> = OnceLock::new();

/// Install the process-wide engine and start its worker. Later calls return
/// the instance installed first.
pub fn init(platform: Arc<dyn Platform>) -> Result<&'static Dio> {
    if let Some(dio) = DIO.get() {
        return Ok(dio);
    }
    let dio = Dio::new(platform)?;
    if DIO.set(dio).is_ok() {
        let dio = global().ok_or_else(|| DioError::Platform("dio not installed".into()))?;
        dio.spawn_task()?;
        info!("dio: engine ready");
    }
    global().ok_or_else(|| DioError::Platform("dio not installed".into()))
}

pub fn global() -> Option<&'static Dio> {
    DIO.get()
}
