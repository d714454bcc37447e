/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The grain supervisor: a long-lived process that launches one instance of
//! one untrusted application package inside a tightly confined Linux sandbox
//! and mediates a small capability-RPC surface between that application and
//! the outside world.
//!
//! The supervisor process and its forked sandboxed child share a socket pair
//! carrying RPC traffic; the supervisor multiplexes external clients (on a
//! Unix socket named `socket` in the grain's var directory) onto the single
//! upstream endpoint exposed by the child.

#[cfg(not(target_os = "linux"))]
compile_error!("only supported on linux");

pub mod child;
pub mod config;
pub mod disk_usage;
pub mod rpc;
pub mod sandbox;
pub mod setup;
pub mod supervisor;
pub mod watchdog;
pub mod wire;
