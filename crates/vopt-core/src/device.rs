//! The host-facing device: a worker thread driving the engine.
//!
//! `submit` hands an I/O descriptor to the engine thread and returns; the
//! completion callback fires when the operation finishes. Administrative
//! operations rendezvous with the engine thread and return their result.
//! Dropping the handle without `shutdown` abandons the engine mid-flight,
//! which is exactly what the crash tests want.

use crate::config::DeviceConfig;
use crate::engine::{Engine, StatsSnapshot};
use crate::super_block::FormatParams;
use crate::vio::{Completion, IoReply, VioOperation};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::info;
use vopt_block::BlockIo;
use vopt_error::{Result, VoptError};
use vopt_types::{DataLocation, Lbn, Pbn, BLOCK_SIZE};

/// Administrative operations on the control channel.
#[derive(Debug)]
pub enum ControlOp {
    Suspend,
    Resume,
    GrowLogical(u64),
    GrowPhysical(u32),
    SetCompression(bool),
    SetDeduplication(bool),
    DumpStatus,
    DumpWorkQueues,
    Stats,
    /// Test hook: stall or unstall the dedupe index.
    StallIndex(bool),
}

/// Replies from the control channel.
#[derive(Debug)]
pub enum ControlReply {
    Done,
    Text(String),
    Stats(Box<StatsSnapshot>),
    Mapping(DataLocation),
    RefCount(u8),
}

enum DeviceMessage {
    Io {
        operation: VioOperation,
        lbn: Lbn,
        data: Vec<u8>,
        completion: Completion,
    },
    Control(ControlOp, Sender<Result<ControlReply>>),
    QueryMapping(Lbn, Sender<Result<ControlReply>>),
    QueryRefCount(Pbn, Sender<Result<ControlReply>>),
    RegisterListener(
        usize,
        crate::read_only::ReadOnlyListener,
        Sender<Result<ControlReply>>,
    ),
    Shutdown { save: bool },
}

/// A running VOpt device.
pub struct VoptDevice {
    sender: Sender<DeviceMessage>,
    worker: Option<JoinHandle<()>>,
}

impl VoptDevice {
    /// Format the backing store. The device is left clean and empty.
    pub fn format(
        storage: &Arc<dyn BlockIo>,
        physical_blocks: u64,
        logical_blocks: u64,
        params: &FormatParams,
    ) -> Result<()> {
        Engine::format(storage, physical_blocks, logical_blocks, params)?;
        Ok(())
    }

    /// Load (recovering if needed) and start the engine worker.
    pub fn start(storage: Arc<dyn BlockIo>, config: DeviceConfig) -> Result<Self> {
        let engine = Engine::open(storage, config)?;
        let (sender, receiver) = unbounded();
        let worker = std::thread::Builder::new()
            .name("vopt-engine".to_owned())
            .spawn(move || engine_loop(engine, receiver))
            .map_err(|e| VoptError::BadState(format!("engine thread spawn failed: {e}")))?;
        Ok(Self {
            sender,
            worker: Some(worker),
        })
    }

    /// Submit one host operation; the completion runs on the engine
    /// thread.
    pub fn submit(
        &self,
        operation: VioOperation,
        lbn: Lbn,
        data: Vec<u8>,
        completion: Completion,
    ) {
        let message = DeviceMessage::Io {
            operation,
            lbn,
            data,
            completion,
        };
        if let Err(send_error) = self.sender.send(message) {
            if let DeviceMessage::Io { completion, .. } = send_error.0 {
                completion(Err(VoptError::BadState("device is shut down".to_owned())));
            }
        }
    }

    /// Run a control operation to completion.
    pub fn control(&self, op: ControlOp) -> Result<ControlReply> {
        let (reply_tx, reply_rx) = bounded(1);
        self.sender
            .send(DeviceMessage::Control(op, reply_tx))
            .map_err(|_| VoptError::BadState("device is shut down".to_owned()))?;
        reply_rx
            .recv()
            .map_err(|_| VoptError::BadState("engine exited".to_owned()))?
    }

    // Blocking conveniences used by tooling and tests.

    pub fn write_block(&self, lbn: Lbn, data: Vec<u8>) -> Result<()> {
        self.write_block_inner(lbn, data, false)
    }

    pub fn write_block_fua(&self, lbn: Lbn, data: Vec<u8>) -> Result<()> {
        self.write_block_inner(lbn, data, true)
    }

    fn write_block_inner(&self, lbn: Lbn, data: Vec<u8>, fua: bool) -> Result<()> {
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        let (tx, rx) = bounded(1);
        self.submit(
            VioOperation::Write { fua },
            lbn,
            data,
            Box::new(move |reply| {
                let _ = tx.send(reply.map(|_| ()));
            }),
        );
        rx.recv()
            .map_err(|_| VoptError::BadState("engine exited".to_owned()))?
    }

    pub fn read_block(&self, lbn: Lbn) -> Result<Vec<u8>> {
        let (tx, rx) = bounded(1);
        self.submit(
            VioOperation::Read,
            lbn,
            Vec::new(),
            Box::new(move |reply| {
                let _ = tx.send(reply);
            }),
        );
        let reply: IoReply = rx
            .recv()
            .map_err(|_| VoptError::BadState("engine exited".to_owned()))??;
        reply
            .data
            .ok_or_else(|| VoptError::BadState("read completed without data".to_owned()))
    }

    pub fn discard_block(&self, lbn: Lbn) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.submit(
            VioOperation::Discard,
            lbn,
            Vec::new(),
            Box::new(move |reply| {
                let _ = tx.send(reply.map(|_| ()));
            }),
        );
        rx.recv()
            .map_err(|_| VoptError::BadState("engine exited".to_owned()))?
    }

    pub fn flush(&self) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.submit(
            VioOperation::Flush,
            Lbn(0),
            Vec::new(),
            Box::new(move |reply| {
                let _ = tx.send(reply.map(|_| ()));
            }),
        );
        rx.recv()
            .map_err(|_| VoptError::BadState("engine exited".to_owned()))?
    }

    /// The mapping currently recorded for `lbn`.
    pub fn mapping_of(&self, lbn: Lbn) -> Result<DataLocation> {
        let (tx, rx) = bounded(1);
        self.sender
            .send(DeviceMessage::QueryMapping(lbn, tx))
            .map_err(|_| VoptError::BadState("device is shut down".to_owned()))?;
        match rx
            .recv()
            .map_err(|_| VoptError::BadState("engine exited".to_owned()))??
        {
            ControlReply::Mapping(mapping) => Ok(mapping),
            other => Err(VoptError::BadState(format!("unexpected reply {other:?}"))),
        }
    }

    /// The raw reference count byte for `pbn`.
    pub fn ref_count_of(&self, pbn: Pbn) -> Result<u8> {
        let (tx, rx) = bounded(1);
        self.sender
            .send(DeviceMessage::QueryRefCount(pbn, tx))
            .map_err(|_| VoptError::BadState("device is shut down".to_owned()))?;
        match rx
            .recv()
            .map_err(|_| VoptError::BadState("engine exited".to_owned()))??
        {
            ControlReply::RefCount(count) => Ok(count),
            other => Err(VoptError::BadState(format!("unexpected reply {other:?}"))),
        }
    }

    /// Register a read-only listener on behalf of `thread`.
    pub fn register_read_only_listener(
        &self,
        thread: usize,
        listener: crate::read_only::ReadOnlyListener,
    ) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.sender
            .send(DeviceMessage::RegisterListener(thread, listener, tx))
            .map_err(|_| VoptError::BadState("device is shut down".to_owned()))?;
        rx.recv()
            .map_err(|_| VoptError::BadState("engine exited".to_owned()))?
            .map(|_| ())
    }

    pub fn stats(&self) -> Result<StatsSnapshot> {
        match self.control(ControlOp::Stats)? {
            ControlReply::Stats(snapshot) => Ok(*snapshot),
            other => Err(VoptError::BadState(format!("unexpected reply {other:?}"))),
        }
    }

    /// Orderly shutdown: suspend (saving everything) and join the worker.
    pub fn shutdown(mut self) -> Result<()> {
        let _ = self.sender.send(DeviceMessage::Shutdown { save: true });
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        Ok(())
    }

    /// Simulated power loss: stop the worker without saving anything.
    pub fn crash(mut self) {
        let _ = self.sender.send(DeviceMessage::Shutdown { save: false });
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for VoptDevice {
    fn drop(&mut self) {
        let _ = self.sender.send(DeviceMessage::Shutdown { save: false });
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn engine_loop(mut engine: Engine, receiver: Receiver<DeviceMessage>) {
    info!(target: "vopt::device", event = "engine_started");
    loop {
        // Wake for the next dedupe deadline even with no traffic.
        let timeout = engine
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_millis(100));
        let message = match receiver.recv_timeout(timeout) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match message {
            Some(DeviceMessage::Io {
                operation,
                lbn,
                data,
                completion,
            }) => {
                engine.submit(operation, lbn, data, completion);
                engine.pump();
            }
            Some(DeviceMessage::Control(op, reply)) => {
                let result = handle_control(&mut engine, op);
                let _ = reply.send(result);
            }
            Some(DeviceMessage::QueryMapping(lbn, reply)) => {
                let _ = reply.send(engine.mapping_of(lbn).map(ControlReply::Mapping));
            }
            Some(DeviceMessage::QueryRefCount(pbn, reply)) => {
                let _ = reply.send(
                    engine
                        .ref_status_of(pbn)
                        .map(|status| ControlReply::RefCount(status.to_byte())),
                );
            }
            Some(DeviceMessage::RegisterListener(thread, listener, reply)) => {
                engine.register_read_only_listener(thread, listener);
                let _ = reply.send(Ok(ControlReply::Done));
            }
            Some(DeviceMessage::Shutdown { save }) => {
                if save {
                    let _ = engine.suspend();
                }
                info!(target: "vopt::device", event = "engine_stopped", saved = save);
                break;
            }
            None => {
                // Idle tick: fragments must not wait in the packer
                // indefinitely while holding their logical locks.
                engine.flush_packer();
                engine.pump();
            }
        }
        engine.poll_timeouts(Instant::now());
    }
}

fn handle_control(engine: &mut Engine, op: ControlOp) -> Result<ControlReply> {
    match op {
        ControlOp::Suspend => {
            // A read-only outcome of suspend is still a successful
            // suspend.
            engine.suspend()?;
            Ok(ControlReply::Done)
        }
        ControlOp::Resume => {
            engine.resume()?;
            Ok(ControlReply::Done)
        }
        ControlOp::GrowLogical(new_logical) => {
            engine.grow_logical(new_logical)?;
            Ok(ControlReply::Done)
        }
        ControlOp::GrowPhysical(added_slabs) => {
            engine.grow_physical(added_slabs)?;
            Ok(ControlReply::Done)
        }
        ControlOp::SetCompression(enabled) => {
            engine.set_compression(enabled);
            Ok(ControlReply::Done)
        }
        ControlOp::SetDeduplication(enabled) => {
            engine.set_deduplication(enabled);
            Ok(ControlReply::Done)
        }
        ControlOp::DumpStatus => Ok(ControlReply::Text(engine.dump_status())),
        ControlOp::DumpWorkQueues => Ok(ControlReply::Text(engine.dump_work_queues())),
        ControlOp::Stats => Ok(ControlReply::Stats(Box::new(engine.stats_snapshot()))),
        ControlOp::StallIndex(stalled) => {
            engine.set_index_stalled(stalled);
            Ok(ControlReply::Done)
        }
    }
}
