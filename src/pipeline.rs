// Copyright 2026 Segstore Project Authors. Licensed under Apache-2.0.

//! Engine-scoped background runtime: one flush thread draining the freeze
//! queue, plus a pool of compression workers converting frozen segments to
//! read-only form, purging, and merging. Owned by the table and torn down
//! with it; shutdown is cooperative via stop flags and a queue sentinel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::table::SegmentedTable;

#[derive(Debug)]
pub(crate) enum BgTask {
    /// Freeze-flush a writable segment, then enqueue its conversion.
    FreezeFlush { seg_idx: usize },
    /// Build the read-only form of a frozen segment and swap it in.
    Convert { seg_idx: usize },
    /// Rewrite over-tombstoned read-only segments in place.
    PurgeDelete,
}

pub(crate) struct BackgroundRuntime {
    flush_tx: Sender<Option<BgTask>>,
    compress_tx: Sender<BgTask>,
    stop_put_to_flush: Arc<AtomicBool>,
    stop_compress: Arc<AtomicBool>,
    flush_stopped: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl BackgroundRuntime {
    pub fn start(table: Weak<SegmentedTable>, compression_workers: usize) -> Self {
        let (flush_tx, flush_rx) = unbounded::<Option<BgTask>>();
        let (compress_tx, compress_rx) = unbounded::<BgTask>();
        let stop_put_to_flush = Arc::new(AtomicBool::new(false));
        let stop_compress = Arc::new(AtomicBool::new(false));
        let flush_stopped = Arc::new(AtomicBool::new(false));

        let mut threads = Vec::with_capacity(compression_workers + 1);
        {
            let table = table.clone();
            let compress_tx = compress_tx.clone();
            let flush_stopped = flush_stopped.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("segstore-flush".into())
                    .spawn(move || {
                        flush_thread(table, flush_rx, compress_tx);
                        flush_stopped.store(true, Ordering::Release);
                        info!("flushing thread completed");
                    })
                    .expect("failed to spawn flush thread"),
            );
        }
        for i in 0..compression_workers {
            let table = table.clone();
            let rx = compress_rx.clone();
            let stop_compress = stop_compress.clone();
            let flush_stopped = flush_stopped.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("segstore-compress-{}", i))
                    .spawn(move || compress_thread(table, rx, stop_compress, flush_stopped))
                    .expect("failed to spawn compression worker"),
            );
        }

        Self {
            flush_tx,
            compress_tx,
            stop_put_to_flush,
            stop_compress,
            flush_stopped,
            threads: Mutex::new(threads),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn accepting_tasks(&self) -> bool {
        !self.stop_put_to_flush.load(Ordering::Acquire)
    }

    /// Returns false when the runtime no longer accepts tasks.
    pub fn push_flush(&self, task: BgTask) -> bool {
        if !self.accepting_tasks() {
            return false;
        }
        self.flush_tx.send(Some(task)).is_ok()
    }

    pub fn push_compress(&self, task: BgTask) -> bool {
        if self.stop_compress.load(Ordering::Acquire) {
            return false;
        }
        self.compress_tx.send(task).is_ok()
    }

    /// Stop accepting work and join all workers. With `drop_pending`,
    /// queued compression tasks are abandoned (flush is always drained);
    /// otherwise workers drain the queue before exiting.
    pub fn shutdown(&self, drop_pending: bool) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_put_to_flush.store(true, Ordering::Release);
        if drop_pending {
            self.stop_compress.store(true, Ordering::Release);
        }
        // nullptr-style sentinel: wakes the flush thread and stops it
        self.flush_tx.send(None).ok();
        let current = std::thread::current().id();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.thread().id() == current {
                // shutdown may run on a worker that dropped the last table
                // handle; it cannot join itself
                continue;
            }
            if let Err(e) = handle.join() {
                error!("background thread panicked: {:?}", e);
            }
        }
        info!("background runtime completed");
    }
}

fn flush_thread(
    table: Weak<SegmentedTable>,
    rx: Receiver<Option<BgTask>>,
    compress_tx: Sender<BgTask>,
) {
    while let Ok(Some(task)) = rx.recv() {
        let BgTask::FreezeFlush { seg_idx } = task else {
            continue;
        };
        let Some(table) = table.upgrade() else {
            break;
        };
        if let Err(e) = table.freeze_flush_writable_segment(seg_idx) {
            error!(seg_idx, error = %e, "freeze-flush failed");
            table.finish_bg_task();
            continue;
        }
        // the conversion inherits this task's slot in bg accounting
        if compress_tx.send(BgTask::Convert { seg_idx }).is_err() {
            table.finish_bg_task();
        }
    }
}

fn compress_thread(
    table: Weak<SegmentedTable>,
    rx: Receiver<BgTask>,
    stop_compress: Arc<AtomicBool>,
    flush_stopped: Arc<AtomicBool>,
) {
    loop {
        if stop_compress.load(Ordering::Acquire) {
            break;
        }
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(task) => {
                if stop_compress.load(Ordering::Acquire) {
                    break;
                }
                let Some(table) = table.upgrade() else {
                    break;
                };
                let desc = format!("{:?}", task);
                let result = match task {
                    BgTask::Convert { seg_idx } => {
                        table.conv_writable_segment_to_readonly(seg_idx)
                    }
                    BgTask::PurgeDelete => table.run_purge_delete(),
                    BgTask::FreezeFlush { .. } => unreachable!(),
                };
                if let Err(e) = result {
                    error!(task = %desc, error = %e, "background task failed");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if flush_stopped.load(Ordering::Acquire) && rx.is_empty() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
