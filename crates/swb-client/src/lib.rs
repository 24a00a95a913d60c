// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Observer-side library for the switchboard ws streams.
//!
//! Two tiers: [`IoDataClient`] mirrors the I/O state table from
//! `/ws_iodata`; [`CtrlClient`] additionally mirrors the engine config from
//! `/ws_ctrl` and can issue commands, streaming back their responses.
//! Both reconnect with a 1 s backoff unless `autokill` is set, in which
//! case a disconnect ends the run loop with an error so the hosting
//! process can exit.

pub mod ctrl;
pub mod iodata;
pub mod table;

pub use ctrl::{CtrlClient, CtrlHandle, CtrlHandler};
pub use iodata::{IoDataClient, IoDataHandler};
pub use table::TableMirror;

pub(crate) const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(1);
