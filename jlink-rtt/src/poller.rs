//! Background polling of one up channel.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::FairMutex;

use crate::{Error, Probe, RttWrapper};

/// A thread that reads an up channel of a shared [`RttWrapper`] at a fixed interval and
/// forwards the data.
///
/// The wrapper is locked for a single read at a time, so other users of it (closing it, for
/// example) get their turn between two polls. Dropping the poller stops the thread after its
/// current iteration without waiting for it.
pub struct RttPoller {
    target_to_host: Receiver<Vec<u8>>,
    stop: Sender<()>,
    handle: JoinHandle<Result<(), Error>>,
}

impl RttPoller {
    /// Spawns the polling thread for up channel `channel`.
    pub fn spawn<P: Probe + 'static>(
        wrapper: Arc<FairMutex<RttWrapper<P>>>,
        channel: u32,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let (data_tx, data_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name(format!("rtt-up-{channel}"))
            .spawn(move || poll(&wrapper, channel, interval, &data_tx, &stop_rx))?;

        Ok(Self {
            target_to_host: data_rx,
            stop: stop_tx,
            handle,
        })
    }

    /// Data read from the target, one message per non-empty read.
    pub fn receiver(&self) -> &Receiver<Vec<u8>> {
        &self.target_to_host
    }

    /// Returns `true` once the polling thread has ended on its own.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the thread and waits for it. Returns the error that ended polling, if any.
    pub fn stop(self) -> Result<(), Error> {
        let Self {
            target_to_host,
            stop,
            handle,
        } = self;

        drop(target_to_host);
        // Fails only if the thread already ended.
        let _ = stop.send(());

        match handle.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

fn poll<P: Probe>(
    wrapper: &FairMutex<RttWrapper<P>>,
    channel: u32,
    interval: Duration,
    data: &Sender<Vec<u8>>,
    stop: &Receiver<()>,
) -> Result<(), Error> {
    tracing::debug!("Polling up channel {channel} every {interval:?}");

    loop {
        let result = wrapper.lock().read_rtt(channel).map(<[u8]>::to_vec);

        match result {
            Ok(bytes) if bytes.is_empty() => {}
            Ok(bytes) => {
                if data.send(bytes).is_err() {
                    tracing::debug!("Receiver of up channel {channel} went away");
                    return Ok(());
                }
            }
            Err(Error::NotConnected) => {
                tracing::debug!("Probe closed, stopped polling up channel {channel}");
                return Ok(());
            }
            Err(error) if error.is_recoverable() => {
                tracing::warn!("Reading up channel {channel} failed, retrying: {error}");
            }
            Err(error) => return Err(error),
        }

        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                tracing::debug!("Stopped polling up channel {channel}");
                return Ok(());
            }
        }
    }
}
