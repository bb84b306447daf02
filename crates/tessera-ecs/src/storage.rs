//! Type-erased columns backing archetype tables.
//!
//! A [`Column`] is a growable byte array holding values of one component
//! type back to back. Row `i` of an archetype is slot `i` of each column.

use std::{alloc::Layout, ptr::NonNull};

use crate::component::ComponentInfo;

/// Densely packed values of one component type.
pub struct Column {
    /// Pointer to the data array; dangling (but aligned) until the first allocation.
    data: NonNull<u8>,
    len: usize,
    /// Allocated capacity in elements.
    capacity: usize,
    info: ComponentInfo,
}

// SAFETY: Column manages its own memory and `Component` requires Send + Sync
unsafe impl Send for Column {}
unsafe impl Sync for Column {}

impl Column {
    #[must_use]
    pub fn new(info: ComponentInfo) -> Self {
        let capacity = if info.size() == 0 { usize::MAX } else { 0 };
        Self {
            data: dangling(info.layout()),
            len: 0,
            capacity,
            info,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn info(&self) -> &ComponentInfo {
        &self.info
    }

    /// Push a component onto the column by copying its bytes.
    ///
    /// # Safety
    ///
    /// - `value` must point to a valid instance of the column's component type.
    /// - The column takes ownership of the bytes; the caller must not drop the source.
    pub unsafe fn push_raw(&mut self, value: *const u8) {
        self.reserve(1);

        // SAFETY: we just reserved space, so `len` is in bounds of the allocation
        let dst = unsafe { self.slot_ptr(self.len) };

        // SAFETY: dst is in bounds and the caller's value lives elsewhere
        unsafe {
            std::ptr::copy_nonoverlapping(value, dst, self.info.size());
        }

        self.len += 1;
    }

    pub fn push<T: 'static>(&mut self, value: T) {
        debug_assert!(
            self.info.is::<T>(),
            "pushed {} into a column of {}",
            std::any::type_name::<T>(),
            self.info.name()
        );

        let value = std::mem::ManuallyDrop::new(value);
        // SAFETY: type checked above; ownership moves into the column
        unsafe {
            self.push_raw(std::ptr::from_ref::<T>(&value).cast());
        }
    }

    /// Remove the element at `index` without dropping it, moving the last
    /// element into the hole.
    ///
    /// Used after the value has been bitwise-copied elsewhere.
    ///
    /// Returns the old index of the element that was moved into `index`,
    /// or `None` if `index` was the last element.
    ///
    /// # Safety
    ///
    /// `index` must be less than `len`, and ownership of the removed value
    /// must already have been transferred.
    pub unsafe fn swap_remove_forget(&mut self, index: usize) -> Option<usize> {
        debug_assert!(index < self.len, "row {index} out of {}", self.len);

        self.len -= 1;
        if index < self.len {
            // SAFETY: both indices are in bounds and distinct
            unsafe {
                let last = self.slot_ptr(self.len);
                let hole = self.slot_ptr(index);
                std::ptr::copy_nonoverlapping(last, hole, self.info.size());
            }
            Some(self.len)
        } else {
            None
        }
    }

    /// Swap-remove that drops the removed value.
    ///
    /// # Safety
    ///
    /// `index` must be less than `len`.
    pub unsafe fn swap_remove_drop(&mut self, index: usize) -> Option<usize> {
        debug_assert!(index < self.len, "row {index} out of {}", self.len);

        // SAFETY: caller ensures index is valid and the slot is initialized
        unsafe {
            self.info.drop_in_place(self.slot_ptr(index));
            self.swap_remove_forget(index)
        }
    }

    /// Slot `index`, with write provenance for callers holding write access.
    ///
    /// # Safety
    ///
    /// `index` must be less than `len`.
    #[must_use]
    pub unsafe fn get_unchecked_raw(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.len);
        unsafe { self.slot_ptr(index) }
    }

    /// # Safety
    ///
    /// `index < len` and `T` is the column's type.
    #[must_use]
    pub unsafe fn get_unchecked<T: 'static>(&self, index: usize) -> &T {
        debug_assert!(self.info.is::<T>(), "column holds {}", self.info.name());
        unsafe { &*self.get_unchecked_raw(index).cast::<T>() }
    }

    /// # Safety
    ///
    /// `index < len` and `T` is the column's type.
    #[must_use]
    pub unsafe fn get_unchecked_mut<T: 'static>(&mut self, index: usize) -> &mut T {
        debug_assert!(self.info.is::<T>(), "column holds {}", self.info.name());
        unsafe { &mut *self.get_unchecked_raw(index).cast::<T>() }
    }

    /// Pointer to the first element. Valid for `len` elements.
    #[must_use]
    pub fn data_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    /// View the column as a typed slice.
    ///
    /// # Safety
    ///
    /// `T` must match the column's component type.
    #[must_use]
    pub unsafe fn as_slice<T: 'static>(&self) -> &[T] {
        debug_assert!(self.info.is::<T>());
        unsafe { std::slice::from_raw_parts(self.data.as_ptr().cast::<T>(), self.len) }
    }

    pub fn reserve(&mut self, additional: usize) {
        let required = self.len.checked_add(additional).expect("column capacity overflow");

        if required <= self.capacity {
            return;
        }

        self.grow(required);
    }

    fn grow(&mut self, min_capacity: usize) {
        // doubling, minimum 4
        let new_capacity = self
            .capacity
            .checked_mul(2)
            .unwrap_or(min_capacity)
            .max(min_capacity)
            .max(4);

        let new_layout = array_layout(&self.info, new_capacity);

        // SAFETY: size is non-zero (ZST columns never grow)
        let new_data = unsafe {
            if self.capacity == 0 {
                std::alloc::alloc(new_layout)
            } else {
                let old_layout = array_layout(&self.info, self.capacity);
                std::alloc::realloc(self.data.as_ptr(), old_layout, new_layout.size())
            }
        };

        let Some(new_data) = NonNull::new(new_data) else {
            std::alloc::handle_alloc_error(new_layout);
        };

        self.data = new_data;
        self.capacity = new_capacity;
    }

    /// Drop every value, keeping the allocation.
    pub fn clear(&mut self) {
        let len = self.len;
        // Zero first so a panicking drop cannot cause a double drop
        self.len = 0;
        if self.info.needs_drop() {
            for i in 0..len {
                // SAFETY: i < old len, every slot is initialized
                unsafe { self.info.drop_in_place(self.slot_ptr(i)) };
            }
        }
    }

    /// Pointer to slot `index`, which may be one past the initialized range.
    unsafe fn slot_ptr(&self, index: usize) -> *mut u8 {
        unsafe { self.data.as_ptr().add(index * self.info.size()) }
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        self.clear();

        if self.info.size() > 0 && self.capacity > 0 {
            let layout = array_layout(&self.info, self.capacity);
            // SAFETY: data was allocated with this layout
            unsafe {
                std::alloc::dealloc(self.data.as_ptr(), layout);
            }
        }
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("component", &self.info.name())
            .field("len", &self.len)
            .finish()
    }
}

fn array_layout(info: &ComponentInfo, count: usize) -> Layout {
    let size = info.size().checked_mul(count).expect("column layout overflow");
    // SAFETY: align comes from a valid Layout
    unsafe { Layout::from_size_align_unchecked(size, info.align()) }
}

/// A non-null pointer aligned for `layout`, usable for ZST reads.
fn dangling(layout: Layout) -> NonNull<u8> {
    // SAFETY: alignment is never zero
    unsafe { NonNull::new_unchecked(std::ptr::without_provenance_mut(layout.align())) }
}
