// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Contract for a background task with a long-running main loop.
///
/// Implementors own their state and loop until cancelled; harnesses such as
/// the processor's worker runner drive `run` on a shared runtime.
pub trait Worker {
    /// Main worker loop. Expected to return only on cancellation.
    fn run(&mut self) -> impl std::future::Future<Output = ()> + Send;
}
