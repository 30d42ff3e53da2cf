/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![warn(rust_2018_idioms)]

mod conn_ext;
mod maybe_cached;
pub mod open_database;

pub use crate::conn_ext::*;
pub use crate::maybe_cached::*;
