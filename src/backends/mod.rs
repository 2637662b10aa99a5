// SPDX-License-Identifier: GPL-3.0-only
//! Implementations of the display capabilities
//!
//! Only the headless backend ships today: it runs anywhere and exercises the
//! full lifecycle without a window system.

pub mod headless;
