//! Playback engine task
//!
//! One tokio task owns the [`Scheduler`]. Commands, decode completions, poll
//! ticks and sink notifications all arrive as messages and are handled one at
//! a time, so the timeline never needs a lock. Decodes run on the blocking
//! pool and report back through their own channel.

use crate::audio::{AudioSink, PcmBuffer, SegmentDecoder, SinkEvent};
use crate::error::{Error, Result};
use crate::playback::scheduler::{DecodeJob, DecodeTicket, Scheduler};
use galleria_common::{EventBus, PlaybackCommand, PlaybackStatus, PlayerEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Command channel depth
const COMMAND_CAPACITY: usize = 64;

enum EngineMessage {
    Command {
        command: PlaybackCommand,
        reply: oneshot::Sender<Result<()>>,
    },
    Poll,
    CatalogUpdated,
    Status {
        reply: oneshot::Sender<Option<PlaybackStatus>>,
    },
    Shutdown,
}

struct Decoded {
    ticket: DecodeTicket,
    result: Result<PcmBuffer>,
}

/// Cloneable front door to the engine task
#[derive(Clone)]
pub struct PlaybackHandle {
    tx: mpsc::Sender<EngineMessage>,
    events: EventBus,
    status: watch::Receiver<Option<PlaybackStatus>>,
}

impl PlaybackHandle {
    /// Apply a command and wait for the scheduler's verdict.
    ///
    /// `Ok` means the request was accepted (or was a no-op); the switch
    /// itself lands once decoding finishes.
    pub async fn dispatch(&self, command: PlaybackCommand) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineMessage::Command { command, reply }).await?;
        rx.await.map_err(|_| Error::EngineStopped)?
    }

    /// Fresh status sampled at the current sink time
    pub async fn current_status(&self) -> Result<Option<PlaybackStatus>> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineMessage::Status { reply }).await?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    /// Status from the most recent poll
    pub fn last_status(&self) -> Option<PlaybackStatus> {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<Option<PlaybackStatus>> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run one status poll now
    pub async fn poll_now(&self) -> Result<()> {
        self.send(EngineMessage::Poll).await
    }

    /// Segment bytes arrived; lets the scheduler retry a waiting successor
    pub async fn notify_catalog_updated(&self) -> Result<()> {
        self.send(EngineMessage::CatalogUpdated).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(EngineMessage::Shutdown).await
    }

    async fn send(&self, msg: EngineMessage) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| Error::EngineStopped)
    }
}

struct PlaybackEngine<S: AudioSink, D: SegmentDecoder> {
    scheduler: Scheduler<S>,
    decoder: Arc<D>,
    commands: mpsc::Receiver<EngineMessage>,
    decoded_tx: mpsc::UnboundedSender<Decoded>,
    decoded_rx: mpsc::UnboundedReceiver<Decoded>,
    sink_events: Option<mpsc::UnboundedReceiver<SinkEvent>>,
    status_tx: watch::Sender<Option<PlaybackStatus>>,
}

/// Start the engine task.
///
/// `sink_events` carries the sink's ended notifications; `None` leaves
/// promotion to the poll path alone.
pub fn spawn_engine<S, D>(
    scheduler: Scheduler<S>,
    decoder: Arc<D>,
    sink_events: Option<mpsc::UnboundedReceiver<SinkEvent>>,
) -> (PlaybackHandle, JoinHandle<()>)
where
    S: AudioSink + 'static,
    D: SegmentDecoder,
{
    let (tx, commands) = mpsc::channel(COMMAND_CAPACITY);
    let (decoded_tx, decoded_rx) = mpsc::unbounded_channel();
    let (status_tx, status) = watch::channel(None);
    let events = scheduler.events().clone();

    let engine = PlaybackEngine {
        scheduler,
        decoder,
        commands,
        decoded_tx,
        decoded_rx,
        sink_events,
        status_tx,
    };

    let task = tokio::spawn(engine.run());
    (PlaybackHandle { tx, events, status }, task)
}

async fn next_sink_event(rx: &mut Option<mpsc::UnboundedReceiver<SinkEvent>>) -> Option<SinkEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl<S: AudioSink + 'static, D: SegmentDecoder> PlaybackEngine<S, D> {
    async fn run(mut self) {
        info!("Playback engine started");

        loop {
            tokio::select! {
                msg = self.commands.recv() => match msg {
                    Some(EngineMessage::Shutdown) | None => break,
                    Some(msg) => self.handle(msg),
                },
                Some(done) = self.decoded_rx.recv() => {
                    self.scheduler.on_decoded(done.ticket, done.result.map(Arc::new));
                }
                event = next_sink_event(&mut self.sink_events) => match event {
                    Some(SinkEvent::VoiceEnded(voice)) => self.scheduler.on_voice_ended(voice),
                    None => {
                        debug!("Sink event channel closed");
                        self.sink_events = None;
                    }
                },
            }
            self.start_decodes();
        }

        info!("Playback engine stopped");
    }

    fn handle(&mut self, msg: EngineMessage) {
        match msg {
            EngineMessage::Command { command, reply } => {
                debug!("Command: {:?}", command);
                let result = match command {
                    PlaybackCommand::ChangeIteration { iteration } => {
                        self.scheduler.request_iteration_change(iteration)
                    }
                    PlaybackCommand::ChangeGallery { gallery } => {
                        self.scheduler.request_gallery_change(gallery)
                    }
                };
                if let Err(e) = &result {
                    warn!("Command rejected: {}", e);
                }
                let _ = reply.send(result);
            }
            EngineMessage::Poll => {
                let status = self.scheduler.tick();
                self.status_tx.send_replace(status);
            }
            EngineMessage::CatalogUpdated => self.scheduler.on_catalog_updated(),
            EngineMessage::Status { reply } => {
                let _ = reply.send(self.scheduler.status());
            }
            EngineMessage::Shutdown => {}
        }
    }

    /// Hand every queued decode to the blocking pool
    fn start_decodes(&mut self) {
        while let Some(DecodeJob { ticket, input }) = self.scheduler.next_decode_job() {
            let decoder = Arc::clone(&self.decoder);
            let tx = self.decoded_tx.clone();
            debug!("Decoding {}", ticket.segment);

            tokio::spawn(async move {
                let result = match tokio::task::spawn_blocking(move || decoder.decode(input)).await {
                    Ok(result) => result,
                    Err(e) => Err(Error::Decode(format!("Decode task failed: {}", e))),
                };
                if tx.send(Decoded { ticket, result }).is_err() {
                    debug!("Engine gone before decode finished");
                }
            });
        }
    }
}
