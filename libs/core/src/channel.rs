// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Typed channels.
//!
//! A channel is a named typed array plus a last-write timestamp and an
//! observer fanout. Two locks split the hot path: the array lock covers the
//! buffer and timestamp (held only for the copy), the notify lock serializes
//! fanouts, so reads proceed while a slow observer runs but only one
//! notification is in flight. Write coalescing is on by default: a write
//! whose bytes equal the current buffer is a successful no-op — no timestamp
//! update, no notification. The timestamp moves if and only if the buffer
//! changed.
//!
//! Re-entrancy: the thread running a channel's fanout holds a thread-local
//! mark on that channel; a write back into the same channel from inside one
//! of its own notifications is rejected with a warning instead of
//! deadlocking. Writers on other threads are unaffected — they copy, then
//! queue on the notify lock for their own fanout.

use core::fmt;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use weir_util::array::{Array, ArrayError};
use weir_util::clock::{Clock, default_clock};
use weir_util::config::{ConfigError, StrConfiguration, parse_value};
use weir_util::named::{Anchor, Named};
use weir_util::observable::{Handler, Observable};
use weir_util::time::Timestamp;
use weir_util::types::{Scalar, Type};
use weir_util::sync;

pub struct Channel {
    named: Named,
    inner: Mutex<Inner>,
    clock: RwLock<Arc<dyn Clock>>,
    observable: Observable<Channel>,
    /// Serializes observer fanouts.
    notify_lock: Mutex<()>,
    write_on_change: AtomicBool,
}

struct Inner {
    array: Array,
    timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// The writing thread is inside this channel's own notification.
    Reentrant,
    Array(ArrayError),
}

thread_local! {
    /// Channels whose fanout is running on this thread, innermost last.
    static NOTIFYING: RefCell<Vec<*const Channel>> = const { RefCell::new(Vec::new()) };
}

/// Clears this thread's notifying mark even if an observer panics.
struct NotifyMark(*const Channel);

// === impl Channel ===

impl Channel {
    /// Creates a detached channel of `len` elements of `ty`, zero-filled,
    /// with write coalescing on and the default monotonic clock.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a valid tree name or `ty` is [`Type::None`].
    pub fn new(name: impl Into<String>, ty: Type, len: usize) -> Arc<Channel> {
        let name = name.into();
        let array = match Array::new(ty, len) {
            Ok(array) => array,
            Err(error) => panic!("channel '{name}': {error}"),
        };
        Arc::new_cyclic(|this: &Weak<Channel>| {
            let this: Weak<dyn Anchor> = this.clone();
            Channel {
                named: Named::new(name, this),
                inner: Mutex::new(Inner {
                    array,
                    timestamp: Timestamp::ZERO,
                }),
                clock: RwLock::new(default_clock()),
                observable: Observable::new(),
                notify_lock: Mutex::new(()),
                write_on_change: AtomicBool::new(true),
            }
        })
    }

    /// Builds a channel from `name=…;type=…;size=…`; all three keys are
    /// required.
    ///
    /// # Errors
    ///
    /// Fails with a [`ConfigError`] on a missing key, an unknown type name,
    /// the `none` type, or an unparseable size.
    pub fn build(conf: &str) -> Result<Arc<Channel>, ConfigError> {
        let conf = StrConfiguration::parse(conf);
        let name = conf.get("name")?;
        let ty = conf.get("type")?;
        let size = conf.get("size")?;

        let ty: Type = parse_value("type", ty)?;
        if ty == Type::None || !weir_util::named::is_valid_name(name) {
            return Err(ConfigError::InvalidValue {
                key: if ty == Type::None { "type" } else { "name" }.to_owned(),
                value: if ty == Type::None { "none".to_owned() } else { name.to_owned() },
            });
        }
        let size: usize = parse_value("size", size)?;
        Ok(Channel::new(name, ty, size))
    }

    pub fn named(&self) -> &Named {
        &self.named
    }

    pub fn name(&self) -> String {
        self.named.name().to_owned()
    }

    pub fn ty(&self) -> Type {
        sync::lock(&self.inner).array.ty()
    }

    /// Element count.
    pub fn len(&self) -> usize {
        sync::lock(&self.inner).array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_size(&self) -> usize {
        sync::lock(&self.inner).array.byte_size()
    }

    /// Timestamp of the last buffer-changing write.
    pub fn timestamp(&self) -> Timestamp {
        sync::lock(&self.inner).timestamp
    }

    pub fn set_clock(&self, clock: Arc<dyn Clock>) {
        *sync::write(&self.clock) = clock;
    }

    /// Write coalescing: when active (the default), a byte-identical write
    /// is a successful no-op.
    pub fn set_write_on_change(&self, active: bool) {
        self.write_on_change.store(active, Ordering::Release);
    }

    /// An owned snapshot of the buffer.
    pub fn clone_array(&self) -> Array {
        sync::lock(&self.inner).array.clone()
    }

    /// Copies the buffer into `dst` at `dst`'s `byte_offset`.
    ///
    /// # Errors
    ///
    /// Fails when the region does not fit into `dst`.
    pub fn copy_to(&self, dst: &mut Array, byte_offset: usize) -> Result<(), ChannelError> {
        let inner = sync::lock(&self.inner);
        dst.copy_from_bytes(inner.array.as_bytes(), byte_offset)
            .map_err(ChannelError::Array)
    }

    /// Reads element `index`.
    ///
    /// # Errors
    ///
    /// Fails on a type mismatch or an out-of-bounds index.
    pub fn read<T: Scalar>(&self, index: usize) -> Result<T, ChannelError> {
        sync::lock(&self.inner)
            .array
            .at(index)
            .map_err(ChannelError::Array)
    }

    /// Writes `src` into the buffer at `byte_offset`, stamping and notifying
    /// when the bytes changed.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Reentrant`] from inside this channel's own fanout;
    /// out-of-range writes fail without touching the buffer.
    pub fn write_bytes(&self, src: &[u8], byte_offset: usize) -> Result<(), ChannelError> {
        if self.commit(src, byte_offset, None)? {
            self.notify();
        }
        Ok(())
    }

    /// Writes one scalar element at `index`.
    ///
    /// # Errors
    ///
    /// Like [`Channel::write_bytes`], plus a type check of `T` against the
    /// element type.
    pub fn write<T: Scalar>(&self, index: usize, value: T) -> Result<(), ChannelError> {
        let mut bytes = [0u8; 8];
        value.write_to(&mut bytes);
        let byte_offset = T::SIZE * index;
        if self.commit(&bytes[..T::SIZE], byte_offset, Some(T::TYPE))? {
            self.notify();
        }
        Ok(())
    }

    /// Writes the full contents of `src`.
    ///
    /// # Errors
    ///
    /// Like [`Channel::write_bytes`].
    pub fn write_array(&self, src: &Array) -> Result<(), ChannelError> {
        self.write_bytes(src.as_bytes(), 0)
    }

    /// Writes the current contents of `other`. The source is snapshotted
    /// first; the two channel locks are never held together.
    ///
    /// # Errors
    ///
    /// Like [`Channel::write_bytes`].
    pub fn write_channel(&self, other: &Channel) -> Result<(), ChannelError> {
        let snapshot = other.clone_array();
        self.write_bytes(snapshot.as_bytes(), 0)
    }

    /// The write algorithm up to (not including) the fanout. `Ok(true)`
    /// means the buffer changed and a notification is due.
    fn commit(
        &self,
        src: &[u8],
        byte_offset: usize,
        expected: Option<Type>,
    ) -> Result<bool, ChannelError> {
        if self.is_notifying_here() {
            tracing::warn!(
                channel = %self.named.full_name(),
                "write from inside this channel's own notification rejected",
            );
            return Err(ChannelError::Reentrant);
        }

        let mut inner = sync::lock(&self.inner);
        if let Some(expected) = expected
            && expected != inner.array.ty()
        {
            let error = ArrayError::TypeMismatch {
                expected: inner.array.ty(),
                actual: expected,
            };
            tracing::error!(channel = %self.named.full_name(), %error, "rejected write");
            return Err(ChannelError::Array(error));
        }
        if byte_offset + src.len() > inner.array.byte_size() {
            tracing::error!(
                channel = %self.named.full_name(),
                len = src.len(),
                byte_offset,
                byte_size = inner.array.byte_size(),
                "rejected out-of-bounds write",
            );
            return Err(ChannelError::Array(ArrayError::OutOfBounds {
                offset: byte_offset,
                len: src.len(),
                byte_size: inner.array.byte_size(),
            }));
        }
        if self.write_on_change.load(Ordering::Acquire)
            && inner.array.is_bytes_equal(src, byte_offset)
        {
            return Ok(false);
        }

        inner
            .array
            .copy_from_bytes(src, byte_offset)
            .map_err(ChannelError::Array)?;
        inner.timestamp = sync::read(&self.clock).now();
        Ok(true)
    }

    /// Runs the observer fanout, with or without a preceding write. Fanouts
    /// serialize on the notify lock; the thread is marked so observers
    /// cannot write back into this channel.
    pub fn notify(&self) {
        let _serialize = sync::lock(&self.notify_lock);
        let _mark = NotifyMark::set(self);
        self.observable.notify_observers(self);
    }

    fn is_notifying_here(&self) -> bool {
        let me = std::ptr::from_ref(self);
        NOTIFYING.with(|marks| marks.borrow().contains(&me))
    }

    pub fn add_observer(&self, observer: &Arc<dyn Handler<Channel>>) -> bool {
        self.observable.add_observer(observer, false)
    }

    pub fn remove_observer(&self, observer: &Arc<dyn Handler<Channel>>) {
        self.observable.remove_observer(observer);
    }

    /// Queues an observer removal from inside a notification.
    pub fn remove_observer_deferred(&self, observer: &Arc<dyn Handler<Channel>>) {
        self.observable.remove_observer_deferred(observer);
    }

    pub fn is_observer(&self, observer: &Arc<dyn Handler<Channel>>) -> bool {
        self.observable.is_observer(observer)
    }

    pub fn observer_count(&self) -> usize {
        self.observable.observer_count()
    }
}

impl Anchor for Channel {
    fn named(&self) -> &Named {
        &self.named
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn description(&self) -> String {
        sync::lock(&self.inner).array.to_string()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = sync::lock(&self.inner);
        f.debug_struct("Channel")
            .field("name", &self.named.name())
            .field("array", &inner.array)
            .field("timestamp", &inner.timestamp)
            .finish()
    }
}

// === impl NotifyMark ===

impl NotifyMark {
    fn set(channel: &Channel) -> Self {
        let ptr = std::ptr::from_ref(channel);
        NOTIFYING.with(|marks| marks.borrow_mut().push(ptr));
        Self(ptr)
    }
}

impl Drop for NotifyMark {
    fn drop(&mut self) {
        NOTIFYING.with(|marks| {
            let mut marks = marks.borrow_mut();
            if let Some(index) = marks.iter().rposition(|mark| *mark == self.0) {
                marks.remove(index);
            }
        });
    }
}

// === impl ChannelError ===

impl From<ArrayError> for ChannelError {
    fn from(error: ArrayError) -> Self {
        ChannelError::Array(error)
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Reentrant => {
                f.write_str("cannot write to a channel from inside its own notification")
            }
            ChannelError::Array(error) => error.fmt(f),
        }
    }
}

impl core::error::Error for ChannelError {}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_util::observable::FnHandler;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn counting_observer() -> (Arc<AtomicUsize>, Arc<dyn Handler<Channel>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let captured = count.clone();
        let observer: Arc<dyn Handler<Channel>> = Arc::new(FnHandler(move |_: &Channel| {
            captured.fetch_add(1, Ordering::SeqCst);
        }));
        (count, observer)
    }

    #[test]
    fn notification_counting() {
        let channel = Channel::new("chan", Type::Float, 4);
        assert_eq!(channel.byte_size(), 4 * size_of::<f32>());
        assert_eq!(channel.len(), 4);
        assert_eq!(channel.ty(), Type::Float);

        let (count, observer) = counting_observer();
        // no observer yet: notify reaches nobody
        channel.notify();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        channel.add_observer(&observer);
        channel.notify();
        channel.notify();
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // a changing write notifies
        channel.write(0, 1.0f32).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
        // write-on-change is the default: same value, no notification
        channel.write(0, 1.0f32).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn read_write_scalars() {
        let channel = Channel::new("chan", Type::Int, 1);
        let (count, observer) = counting_observer();
        channel.add_observer(&observer);

        assert_eq!(channel.read::<i32>(0), Ok(0));
        channel.write(0, 20i32).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(channel.read::<i32>(0), Ok(20));

        // wrong type and out-of-bounds reads fail
        assert!(matches!(
            channel.read::<f64>(0),
            Err(ChannelError::Array(ArrayError::TypeMismatch { .. }))
        ));
        assert!(matches!(
            channel.read::<i32>(1),
            Err(ChannelError::Array(ArrayError::OutOfBounds { .. }))
        ));
        assert!(matches!(
            channel.write(0, 1.5f32),
            Err(ChannelError::Array(ArrayError::TypeMismatch { .. }))
        ));
    }

    #[test]
    fn write_on_change_controls_coalescing() {
        let channel = Channel::new("chan", Type::Double, 6);
        let (count, observer) = counting_observer();
        channel.add_observer(&observer);

        let values = Array::from_values(&[1.0f64, 1.1, 1.2, 1.3, 1.4, 1.5]);
        channel.write_array(&values).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(
            channel.clone_array().to_vec::<f64>().unwrap(),
            vec![1.0, 1.1, 1.2, 1.3, 1.4, 1.5]
        );

        // identical bytes: coalesced
        channel.write_array(&values).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // coalescing off: every successful write notifies
        channel.set_write_on_change(false);
        channel.write_array(&values).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn timestamp_moves_only_when_bytes_change() {
        let channel = Channel::new("chan", Type::Int, 1);
        assert_eq!(channel.timestamp(), Timestamp::ZERO);

        channel.write(0, 5i32).unwrap();
        let stamped = channel.timestamp();
        assert!(stamped > Timestamp::ZERO);

        channel.write(0, 5i32).unwrap();
        assert_eq!(channel.timestamp(), stamped);

        channel.write(0, 6i32).unwrap();
        assert!(channel.timestamp() > stamped);
    }

    #[test]
    fn boundary_writes() {
        let channel = Channel::new("chan", Type::UByte, 4);
        // byte_offset + len == byte_size succeeds
        assert!(channel.write_bytes(&[1, 2], 2).is_ok());
        // one past the end fails
        assert!(matches!(
            channel.write_bytes(&[1, 2], 3),
            Err(ChannelError::Array(ArrayError::OutOfBounds { .. }))
        ));
        assert_eq!(channel.clone_array().as_bytes(), &[0, 0, 1, 2]);
    }

    #[test]
    fn reentrant_writes_are_rejected_not_deadlocked() {
        let channel = Channel::new("chan", Type::Int, 1);
        let reentrant_result = Arc::new(Mutex::new(None));

        let observer: Arc<dyn Handler<Channel>> = {
            let result = reentrant_result.clone();
            Arc::new(FnHandler(move |chan: &Channel| {
                *sync::lock(&result) = Some(chan.write(0, 99i32));
            }))
        };
        channel.add_observer(&observer);

        channel.write(0, 1i32).unwrap();
        assert_eq!(
            *sync::lock(&reentrant_result),
            Some(Err(ChannelError::Reentrant))
        );
        // the nested write must not have landed
        assert_eq!(channel.read::<i32>(0), Ok(1));
    }

    #[test]
    fn cross_channel_writes_from_observers_are_fine() {
        let source = Channel::new("source", Type::Int, 1);
        let mirror = Channel::new("mirror", Type::Int, 1);

        let observer: Arc<dyn Handler<Channel>> = {
            let mirror = mirror.clone();
            Arc::new(FnHandler(move |chan: &Channel| {
                mirror.write_channel(chan).unwrap();
            }))
        };
        source.add_observer(&observer);

        source.write(0, 123i32).unwrap();
        assert_eq!(mirror.read::<i32>(0), Ok(123));
    }

    #[test]
    fn observers_may_remove_themselves_deferred() {
        let channel = Channel::new("chan", Type::Int, 1);
        let count = Arc::new(AtomicUsize::new(0));

        let observer_slot: Arc<Mutex<Option<Arc<dyn Handler<Channel>>>>> =
            Arc::new(Mutex::new(None));
        let observer: Arc<dyn Handler<Channel>> = {
            let count = count.clone();
            let slot = observer_slot.clone();
            Arc::new(FnHandler(move |chan: &Channel| {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(me) = sync::lock(&slot).as_ref() {
                    chan.remove_observer_deferred(me);
                }
            }))
        };
        *sync::lock(&observer_slot) = Some(observer.clone());
        channel.add_observer(&observer);

        channel.notify();
        channel.notify();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn build_from_configuration() {
        assert!(Channel::build("").is_err());
        assert!(Channel::build("name=test").is_err());
        assert!(Channel::build("name=test;type=int").is_err());
        assert!(matches!(
            Channel::build("name=test;type=int;size=toto"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            Channel::build("name=test;type=inttt;size=2"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(Channel::build("name=test;type=none;size=2").is_err());

        let channel = Channel::build("name=chan;type=float;size=2").unwrap();
        assert_eq!(channel.named().name(), "chan");
        assert_eq!(channel.ty(), Type::Float);
        assert_eq!(channel.len(), 2);
    }

    #[test]
    fn observers_see_each_write_exactly_once_in_order() {
        let channel = Channel::new("chan", Type::Int, 1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer: Arc<dyn Handler<Channel>> = {
            let seen = seen.clone();
            Arc::new(FnHandler(move |chan: &Channel| {
                sync::lock(&seen).push(chan.read::<i32>(0).unwrap());
            }))
        };
        channel.add_observer(&observer);

        for value in [1i32, 2, 3, 4] {
            channel.write(0, value).unwrap();
        }
        assert_eq!(*sync::lock(&seen), vec![1, 2, 3, 4]);
    }

    proptest::proptest! {
        #[test]
        fn scalar_writes_round_trip(values in proptest::collection::vec(proptest::prelude::any::<i32>(), 1..8)) {
            let channel = Channel::new("chan", Type::Int, values.len());
            channel.set_write_on_change(false);
            for (i, value) in values.iter().enumerate() {
                channel.write(i, *value).unwrap();
            }
            proptest::prop_assert_eq!(channel.clone_array().to_vec::<i32>().unwrap(), values);
        }
    }

    #[test]
    fn per_channel_marks_nest() {
        // writing channel B from inside A's fanout, where B's fanout writes
        // back into A, must reject only the B→A leg
        let a = Channel::new("a", Type::Int, 1);
        let b = Channel::new("b", Type::Int, 1);
        let results: Arc<Mutex<HashMap<&'static str, Result<(), ChannelError>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let b_observer: Arc<dyn Handler<Channel>> = {
            let a = a.clone();
            let results = results.clone();
            Arc::new(FnHandler(move |_: &Channel| {
                sync::lock(&results).insert("b->a", a.write(0, 7i32));
            }))
        };
        b.add_observer(&b_observer);

        let a_observer: Arc<dyn Handler<Channel>> = {
            let b = b.clone();
            let results = results.clone();
            Arc::new(FnHandler(move |_: &Channel| {
                sync::lock(&results).insert("a->b", b.write(0, 3i32));
            }))
        };
        a.add_observer(&a_observer);

        a.write(0, 1i32).unwrap();
        let results = sync::lock(&results);
        assert_eq!(results.get("a->b"), Some(&Ok(())));
        assert_eq!(results.get("b->a"), Some(&Err(ChannelError::Reentrant)));
        drop(results);
        assert_eq!(a.read::<i32>(0), Ok(1));
        assert_eq!(b.read::<i32>(0), Ok(3));
    }
}
