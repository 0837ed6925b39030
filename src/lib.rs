// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # pxstream
//!
//! A distributed, tiled pixel-streaming fabric: a group of **producer**
//! processes, each owning a rectangular tile of a larger image, stream
//! frames over TCP to a group of **consumer** processes, each of which
//! declares an arbitrary rectangular subregion of the global image it
//! wants. The fabric negotiates formats and tile geometry at bootstrap,
//! moves tile bytes every frame, and redistributes them across the
//! consumer group so each consumer ends up holding exactly the bytes
//! inside its declared subregion.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐        TCP mesh        ┌─────────────┐
//! │ Producer 0   │◄───────────────────────►│ Consumer 0   │
//! │ (tile 0)     │                        │ (selection)  │
//! └─────────────┘                        └──────┬───────┘
//! ┌─────────────┐                               │ group primitive
//! │ Producer 1   │◄──────────────────────┐      │ (redistribution)
//! │ (tile 1)     │                       │      ▼
//! └─────────────┘                ┌─────────────┐
//! ┌─────────────┐                │ Consumer 1   │
//! │ Producer N   │◄───────────────│ (selection)  │
//! │ (tile N)     │                └─────────────┘
//! └─────────────┘
//! ```
//!
//! Producer processes and consumer processes each coordinate *within*
//! their own role through a [`group::GroupComm`] (broadcast, gather,
//! barrier, tagged point-to-point); *between* roles they speak only the
//! TCP wire protocol in [`wire`].
//!
//! ## Quick start
//!
//! ```no_run
//! use std::net::IpAddr;
//! use bytes::Bytes;
//! use pxstream::format::{PixelDataType, PixelFormat};
//! use pxstream::group::LocalGroup;
//! use pxstream::producer::{Producer, StreamBehavior};
//!
//! # fn main() -> pxstream::Result<()> {
//! let group = LocalGroup::new_fleet(1).remove(0);
//! let iface: IpAddr = "127.0.0.1".parse().expect("valid IPv4 literal");
//! let mut producer = Producer::new(iface, 5000, 5100, Box::new(group))?;
//! producer.set_image_format(PixelFormat::Rgba, PixelDataType::U8)?;
//! producer.set_global_image_size(16, 16);
//! producer.set_local_image_size(16, 16);
//! producer.set_local_image_offset(0, 0);
//! producer.listen(StreamBehavior::WaitForAll, 0)?;
//! producer.set_frame_image(Bytes::from(vec![0u8; 16 * 16 * 4]));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod consumer;
pub mod error;
pub mod format;
pub mod geometry;
pub mod group;
pub mod net;
pub mod producer;
pub mod redistribution;
pub mod wire;

// Re-exports
pub use consumer::Consumer;
pub use error::{PxError, Result};
pub use format::{PixelDataType, PixelFormat};
pub use geometry::Rect;
pub use group::{GroupComm, LocalGroup};
pub use producer::{Producer, StreamBehavior};
pub use redistribution::RedistributionDescriptor;
