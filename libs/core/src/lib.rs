// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The composition layer of the weir runtime: typed channels with observer
//! fanout and write coalescing, channel containers with declarative links,
//! lifecycle-cascading devices, and the record/replay pipeline.

pub mod channel;
pub mod container;
pub mod device;
pub mod mem_recorder;
pub mod player;
pub mod pulsation;
pub mod records;
pub mod recorder;
pub mod sampler;
pub mod waiter;

pub use channel::{Channel, ChannelError};
pub use container::ChannelContainer;
pub use device::{Core, Device, DeviceBase};
pub use mem_recorder::MemRecorder;
pub use player::Player;
pub use pulsation::Pulsation;
pub use records::{PlayableRecord, RecordSink, RecordStore};
pub use recorder::Recorder;
pub use sampler::Sampler;
pub use waiter::ChannelWaiter;
