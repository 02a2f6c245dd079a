/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Crate-wide plumbing: errors, clock and logging

pub mod app_clock;
pub mod error;
pub mod log;

pub use log::init_log;
