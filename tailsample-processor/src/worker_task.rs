// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Harness tying a [`Worker`] to a runtime with a cancellation token.

use std::fmt::Display;
use tailsample_common::worker::Worker;
use tokio::{runtime::Runtime, select, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// A background worker that can be started on a runtime and stopped through
/// its cancellation token.
///
/// # Cancellation safety
/// The worker's main loop is interrupted at whatever yield point it is
/// suspended on when the token fires; loops must keep their shared state
/// consistent across every `.await`.
#[derive(Debug)]
pub(crate) enum WorkerTask<T: Worker + Send + 'static> {
    Idle {
        worker: T,
    },
    Running {
        handle: JoinHandle<T>,
        stop_token: CancellationToken,
    },
    Stopped,
}

#[derive(Debug)]
pub(crate) enum WorkerTaskError {
    /// The task was started after being stopped, or its state was lost.
    InvalidState,
    /// The task was aborted out from under the harness.
    TaskAborted,
}

impl Display for WorkerTaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerTaskError::InvalidState => {
                write!(f, "worker is in an invalid state and must be recreated")
            }
            WorkerTaskError::TaskAborted => write!(f, "worker task has been aborted"),
        }
    }
}

impl std::error::Error for WorkerTaskError {}

impl<T: Worker + Send + 'static> WorkerTask<T> {
    pub(crate) fn new(worker: T) -> Self {
        Self::Idle { worker }
    }

    /// Run the worker's main loop on the given runtime. Starting a running
    /// task is a no-op.
    pub(crate) fn start(&mut self, rt: &Runtime) -> Result<(), WorkerTaskError> {
        if let Self::Running { .. } = self {
            return Ok(());
        }
        if let Self::Idle { mut worker } = std::mem::replace(self, Self::Stopped) {
            let stop_token = CancellationToken::new();
            let cloned_token = stop_token.clone();
            let handle = rt.spawn(async move {
                select! {
                    _ = worker.run() => worker,
                    _ = cloned_token.cancelled() => worker,
                }
            });
            *self = Self::Running { handle, stop_token };
            Ok(())
        } else {
            Err(WorkerTaskError::InvalidState)
        }
    }

    /// Cancel the worker and wait for its loop to unwind.
    pub(crate) async fn stop(&mut self) -> Result<(), WorkerTaskError> {
        match std::mem::replace(self, Self::Stopped) {
            Self::Running { handle, stop_token } => {
                stop_token.cancel();
                handle.await.map(|_| ()).map_err(|_| WorkerTaskError::TaskAborted)
            }
            Self::Idle { .. } | Self::Stopped => Ok(()),
        }
    }
}
