/// Periodic frame emission.
///
/// The ticker task owns the child's input stream. Ticks are chained: the next
/// one is scheduled only after the current frame's writes finished, so at most
/// one frame is in flight. The first tick always runs; a stop request is only
/// looked at between ticks. A write still stuck once the stop grace period is
/// over gets dropped together with the stream.
use crate::frame::{self, Frame};
use crate::session::{EventSink, SessionEvent};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Delay between the end of one tick and the start of the next.
pub const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Counter value before the first tick; the first frame carries seed + 1.
pub const SEQUENCE_SEED: u64 = 7;

/// How long a stopped ticker may spend finishing its in-flight frame.
pub const STOP_GRACE: Duration = Duration::from_secs(1);

/// Counts accumulated by a ticker over its lifetime.
///
/// A tick abandoned after [`STOP_GRACE`] counts in `ticks` but in neither
/// `frames_written` nor `frames_failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub ticks: u64,
    pub frames_written: u64,
    pub frames_failed: u64,
    /// Sequence byte of the most recent tick.
    pub last_sequence: Option<u8>,
}

/// Handle to a running ticker task.
pub struct Ticker {
    stop: watch::Sender<bool>,
    stats: watch::Receiver<TickStats>,
    handle: JoinHandle<()>,
}

impl Ticker {
    /// Spawn the ticker; the first tick runs immediately.
    pub fn start<W>(input: W, events: EventSink) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        let (stats_tx, stats) = watch::channel(TickStats::default());
        let handle = tokio::spawn(tick_loop(input, events, stop_rx, stats_tx));
        Self {
            stop,
            stats,
            handle,
        }
    }

    /// Stop scheduling ticks and return the counts.
    ///
    /// An in-flight tick gets [`STOP_GRACE`] to finish. After that the task is
    /// aborted, which drops the input stream.
    pub async fn stop(mut self) -> TickStats {
        // Fails only if the task already ended, which is the goal anyway.
        let _ = self.stop.send(true);
        match tokio::time::timeout(STOP_GRACE, &mut self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "ticker task did not finish cleanly");
            }
            Err(_) => {
                tracing::warn!(
                    grace_ms = STOP_GRACE.as_millis() as u64,
                    "frame write still pending after exit, dropping child stdin"
                );
                self.handle.abort();
                // Wait for the abort so the stream is gone when this returns.
                let _ = (&mut self.handle).await;
            }
        }
        let stats = *self.stats.borrow();
        stats
    }
}

async fn tick_loop<W>(
    mut input: W,
    events: EventSink,
    mut stop: watch::Receiver<bool>,
    stats: watch::Sender<TickStats>,
) where
    W: AsyncWrite + Unpin,
{
    let mut counter = SEQUENCE_SEED;

    loop {
        counter += 1;
        let sequence = Frame::for_counter(counter).sequence();
        stats.send_modify(|s| {
            s.ticks += 1;
            s.last_sequence = Some(sequence);
        });

        match frame::write_frame(&mut input, sequence).await {
            Ok(()) => {
                stats.send_modify(|s| s.frames_written += 1);
                events.emit(SessionEvent::FrameWritten { sequence });
            }
            Err(error) => {
                stats.send_modify(|s| s.frames_failed += 1);
                events.emit(SessionEvent::FrameFailed { sequence, error });
            }
        }

        tokio::select! {
            biased;
            // A dropped sender counts as a stop request too.
            _ = stop.changed() => break,
            _ = tokio::time::sleep(TICK_INTERVAL) => {}
        }
    }

    let done = *stats.borrow();
    tracing::debug!(
        ticks = done.ticks,
        frames_written = done.frames_written,
        frames_failed = done.frames_failed,
        "ticker stopped"
    );
}
