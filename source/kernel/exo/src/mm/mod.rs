// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical frames, page tables and address spaces.

pub mod address_space;
pub mod frame;
pub mod page_table;

pub use address_space::{AddressSpace, PageFault};
pub use exo_abi::layout::PAGE_SIZE;
pub use frame::{FrameError, FrameId, FrameTable};
pub use page_table::{MapError, PageTable, Pte};
