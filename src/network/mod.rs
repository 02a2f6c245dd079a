/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Network layer: TLS client setup, wire framing and upstream connections

pub mod tls_config;
pub mod transport;
pub mod upstream;
