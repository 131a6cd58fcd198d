// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Architecture hooks used by the page-table walker.

pub mod x86_64;
