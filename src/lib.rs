// SPDX-License-Identifier: Apache-2.0

pub mod agent;
pub mod bounded_channel;
pub mod listener;
pub mod loader;
pub mod metrics;
pub mod runtime;
pub mod tailer;
pub mod watcher;
