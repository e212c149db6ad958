// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod anonymize;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod gatherers;
pub mod logs;
pub mod pager;
pub mod record;
pub mod recorder;
pub mod registry;
pub mod tree;
