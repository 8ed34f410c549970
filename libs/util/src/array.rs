// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Typed byte arrays.
//!
//! An [`Array`] owns a contiguous byte buffer tagged with an element [`Type`]
//! and an element count. It is the opaque byte vehicle of the runtime: the
//! same abstraction carries a single scalar and a multi-element buffer, which
//! keeps the channel API uniform.
//!
//! Storage is either owned or externally assigned. An externally assigned
//! buffer is never freed and never reallocated: any operation that would have
//! to grow it fails with [`ArrayError::ExternalStorage`].

use core::fmt;
use core::ptr::NonNull;

use crate::types::{Scalar, Type};

pub struct Array {
    ty: Type,
    len: usize,
    storage: Storage,
}

enum Storage {
    Owned(Vec<u8>),
    External { ptr: NonNull<u8>, capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayError {
    /// The element type has no representation (`Type::None`).
    InvalidType,
    /// A byte range fell outside the array.
    OutOfBounds {
        offset: usize,
        len: usize,
        byte_size: usize,
    },
    /// A typed access disagreed with the element type.
    TypeMismatch { expected: Type, actual: Type },
    /// The operation would grow or reallocate an externally assigned buffer.
    ExternalStorage,
    /// A byte length is not a multiple of the element size.
    Misaligned { byte_len: usize, elem_size: usize },
}

// Safety: the owned variant is a plain `Vec`. For the external variant the
// caller of `assign_external` guarantees the buffer outlives the array and is
// not accessed concurrently except through it (see the safety contract
// there), which makes moving or sharing the pointer across threads sound.
unsafe impl Send for Array {}
// Safety: see the `Send` impl above.
unsafe impl Sync for Array {}

// === impl Array ===

impl Array {
    /// Creates a zero-filled array of `len` elements of `ty`.
    ///
    /// # Errors
    ///
    /// Fails with [`ArrayError::InvalidType`] for [`Type::None`], which has
    /// no element representation.
    pub fn new(ty: Type, len: usize) -> Result<Self, ArrayError> {
        if ty == Type::None {
            return Err(ArrayError::InvalidType);
        }
        Ok(Self {
            ty,
            len,
            storage: Storage::Owned(vec![0; len * ty.size()]),
        })
    }

    /// Creates an array holding a copy of `values`.
    pub fn from_values<T: Scalar>(values: &[T]) -> Self {
        let mut bytes = vec![0u8; values.len() * T::SIZE];
        for (i, value) in values.iter().enumerate() {
            value.write_to(&mut bytes[i * T::SIZE..]);
        }
        Self {
            ty: T::TYPE,
            len: values.len(),
            storage: Storage::Owned(bytes),
        }
    }

    #[inline]
    pub fn ty(&self) -> Type {
        self.ty
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn byte_size(&self) -> usize {
        self.len * self.ty.size()
    }

    pub fn byte_capacity(&self) -> usize {
        match &self.storage {
            Storage::Owned(vec) => vec.capacity(),
            Storage::External { capacity, .. } => *capacity,
        }
    }

    /// Element capacity of the current allocation.
    pub fn capacity(&self) -> usize {
        self.byte_capacity() / self.ty.size()
    }

    /// Whether the buffer was assigned with [`Array::assign_external`].
    pub fn is_external(&self) -> bool {
        matches!(self.storage, Storage::External { .. })
    }

    /// Byte offset of element `index`.
    #[inline]
    pub fn byte_index(&self, index: usize) -> usize {
        index * self.ty.size()
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned(vec) => &vec[..self.byte_size()],
            // Safety: `assign_external`'s contract keeps `ptr..ptr+capacity`
            // valid for the lifetime of the array and `len` never exceeds it.
            Storage::External { ptr, .. } => unsafe {
                core::slice::from_raw_parts(ptr.as_ptr(), self.byte_size())
            },
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let byte_size = self.byte_size();
        match &mut self.storage {
            Storage::Owned(vec) => &mut vec[..byte_size],
            // Safety: see `as_bytes`; `&mut self` gives exclusive access.
            Storage::External { ptr, .. } => unsafe {
                core::slice::from_raw_parts_mut(ptr.as_ptr(), byte_size)
            },
        }
    }

    /// Reads element `index`.
    ///
    /// # Errors
    ///
    /// Fails if `T` does not match the element type or `index` is out of
    /// bounds.
    pub fn at<T: Scalar>(&self, index: usize) -> Result<T, ArrayError> {
        self.check_type::<T>()?;
        let offset = self.byte_index(index);
        if offset + T::SIZE > self.byte_size() {
            return Err(self.out_of_bounds(offset, T::SIZE));
        }
        Ok(T::read_from(&self.as_bytes()[offset..]))
    }

    /// Writes element `index`.
    ///
    /// # Errors
    ///
    /// Fails if `T` does not match the element type or `index` is out of
    /// bounds.
    pub fn set<T: Scalar>(&mut self, index: usize, value: T) -> Result<(), ArrayError> {
        self.check_type::<T>()?;
        let offset = self.byte_index(index);
        if offset + T::SIZE > self.byte_size() {
            return Err(self.out_of_bounds(offset, T::SIZE));
        }
        value.write_to(&mut self.as_bytes_mut()[offset..]);
        Ok(())
    }

    /// Copies the whole array out as a vector of scalars.
    ///
    /// # Errors
    ///
    /// Fails if `T` does not match the element type.
    pub fn to_vec<T: Scalar>(&self) -> Result<Vec<T>, ArrayError> {
        self.check_type::<T>()?;
        let bytes = self.as_bytes();
        Ok((0..self.len)
            .map(|i| T::read_from(&bytes[i * T::SIZE..]))
            .collect())
    }

    /// Copies `src` into the buffer at `byte_offset`. The buffer is not
    /// resized; writing past the end fails.
    ///
    /// # Errors
    ///
    /// Fails with [`ArrayError::OutOfBounds`] if
    /// `byte_offset + src.len() > byte_size`.
    pub fn copy_from_bytes(&mut self, src: &[u8], byte_offset: usize) -> Result<(), ArrayError> {
        if byte_offset + src.len() > self.byte_size() {
            return Err(self.out_of_bounds(byte_offset, src.len()));
        }
        self.as_bytes_mut()[byte_offset..byte_offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Fills `dst` from the buffer starting at `byte_offset`.
    ///
    /// # Errors
    ///
    /// Fails with [`ArrayError::OutOfBounds`] if
    /// `byte_offset + dst.len() > byte_size`.
    pub fn copy_to_bytes(&self, dst: &mut [u8], byte_offset: usize) -> Result<(), ArrayError> {
        if byte_offset + dst.len() > self.byte_size() {
            return Err(self.out_of_bounds(byte_offset, dst.len()));
        }
        dst.copy_from_slice(&self.as_bytes()[byte_offset..byte_offset + dst.len()]);
        Ok(())
    }

    /// Resizes to exactly `src` and copies it in.
    ///
    /// # Errors
    ///
    /// Fails if `src.len()` is not a multiple of the element size, or if the
    /// resize would grow an external buffer.
    pub fn from_bytes(&mut self, src: &[u8]) -> Result<(), ArrayError> {
        let elem_size = self.ty.size();
        if src.len() % elem_size != 0 {
            return Err(ArrayError::Misaligned {
                byte_len: src.len(),
                elem_size,
            });
        }
        self.resize(src.len() / elem_size)?;
        self.copy_from_bytes(src, 0)
    }

    /// Whether the buffer at `byte_offset` equals `other`. Out-of-range
    /// comparisons are unequal.
    pub fn is_bytes_equal(&self, other: &[u8], byte_offset: usize) -> bool {
        if byte_offset + other.len() > self.byte_size() {
            return false;
        }
        &self.as_bytes()[byte_offset..byte_offset + other.len()] == other
    }

    /// Resizes to `len` elements, zero-filling any growth.
    ///
    /// # Errors
    ///
    /// Fails with [`ArrayError::ExternalStorage`] if the array holds an
    /// external buffer whose capacity is too small — external storage is
    /// never reallocated.
    pub fn resize(&mut self, len: usize) -> Result<(), ArrayError> {
        let byte_size = len * self.ty.size();
        match &mut self.storage {
            Storage::Owned(vec) => vec.resize(byte_size, 0),
            Storage::External { capacity, .. } => {
                if byte_size > *capacity {
                    return Err(ArrayError::ExternalStorage);
                }
            }
        }
        self.len = len;
        Ok(())
    }

    /// Replaces the storage with a caller-provided buffer. The array no
    /// longer owns its storage: it will never free, grow or reallocate the
    /// buffer, and `len` becomes `byte_capacity / element size`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `byte_capacity` bytes that stay valid, and are not
    /// read or written except through this array, for as long as the array
    /// (or any clone-source use of it) is alive.
    pub unsafe fn assign_external(&mut self, ptr: NonNull<u8>, byte_capacity: usize) {
        self.len = byte_capacity / self.ty.size();
        self.storage = Storage::External {
            ptr,
            capacity: byte_capacity,
        };
    }

    fn check_type<T: Scalar>(&self) -> Result<(), ArrayError> {
        if T::TYPE == self.ty {
            Ok(())
        } else {
            Err(ArrayError::TypeMismatch {
                expected: self.ty,
                actual: T::TYPE,
            })
        }
    }

    fn out_of_bounds(&self, offset: usize, len: usize) -> ArrayError {
        ArrayError::OutOfBounds {
            offset,
            len,
            byte_size: self.byte_size(),
        }
    }
}

impl Clone for Array {
    /// Clones into an independently owned array, regardless of whether the
    /// source storage is external.
    fn clone(&self) -> Self {
        Self {
            ty: self.ty,
            len: self.len,
            storage: Storage::Owned(self.as_bytes().to_vec()),
        }
    }
}

impl PartialEq for Array {
    fn eq(&self, other: &Self) -> bool {
        self.ty == other.ty && self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Array {}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Array")
            .field("ty", &self.ty)
            .field("len", &self.len)
            .field("external", &self.is_external())
            .finish()
    }
}

impl fmt::Display for Array {
    /// The `type[len]` shorthand used in tree descriptions.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.ty, self.len)
    }
}

// === impl ArrayError ===

impl fmt::Display for ArrayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayError::InvalidType => f.write_str("element type has no representation"),
            ArrayError::OutOfBounds {
                offset,
                len,
                byte_size,
            } => write!(
                f,
                "cannot access {len} bytes at offset {offset} in {byte_size} bytes"
            ),
            ArrayError::TypeMismatch { expected, actual } => {
                write!(f, "element type is {expected}, not {actual}")
            }
            ArrayError::ExternalStorage => {
                f.write_str("externally assigned storage cannot be reallocated")
            }
            ArrayError::Misaligned {
                byte_len,
                elem_size,
            } => write!(
                f,
                "{byte_len} bytes is not a whole number of {elem_size}-byte elements"
            ),
        }
    }
}

impl core::error::Error for ArrayError {}
