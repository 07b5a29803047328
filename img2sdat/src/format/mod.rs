// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

pub mod rangeset;
pub mod sparse;
pub mod transfer;
