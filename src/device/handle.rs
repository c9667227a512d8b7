//! Reference-counted handles to registry objects
//!
//! Every object the device registry hands out (context, enumerator, monitor,
//! device) carries an external reference count. [`Handle`] owns exactly one of
//! those references and gives it back on drop.
//!
//! Ownership transfer is always explicit:
//!
//! - [`Handle::acquire`] adopts a pointer that already carries a reference
//!   (results of `*_new` calls and of receiving from a monitor).
//! - [`Handle::retain`] takes a new reference on a borrowed pointer (parent
//!   lookups, which the registry returns without a reference of their own).
//! - [`Clone`] takes one more reference; [`Drop`] gives one back.
//!
//! [`Borrowed`] is the non-owning view used for pointers whose lifetime is tied
//! to another object. It can only become owned through [`Borrowed::to_owned`].

use crate::core::error::{Result, WatchError};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

/// Reference counting operations of one kind of registry object
///
/// Implemented on the (usually opaque) pointee type, so `Handle<udev_device>`
/// knows to call `udev_device_ref`/`udev_device_unref`.
pub trait RefCounted {
    /// Take one more reference on `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object of this kind.
    unsafe fn add_ref(ptr: NonNull<Self>);

    /// Give back one reference on `ptr`. The registry releases the object
    /// when the count reaches zero.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live object and the caller must own the
    /// reference being released.
    unsafe fn release(ptr: NonNull<Self>);
}

/// Owning handle to a reference-counted registry object
///
/// A handle is either present (owns one reference) or empty. Empty handles
/// never touch the registry: dropping or cloning one is a no-op.
pub struct Handle<T: RefCounted> {
    ptr: Option<NonNull<T>>,
}

impl<T: RefCounted> Handle<T> {
    /// An empty handle
    pub const fn empty() -> Self {
        Self { ptr: None }
    }

    /// Adopt a pointer that already carries a reference, without incrementing it.
    ///
    /// A null pointer yields an empty handle.
    ///
    /// # Safety
    ///
    /// `raw` must be null or point to a live object whose reference is
    /// transferred to the returned handle.
    pub unsafe fn acquire(raw: *mut T) -> Self {
        Self {
            ptr: NonNull::new(raw),
        }
    }

    /// Take a new reference on a borrowed pointer and wrap it.
    ///
    /// A null pointer yields an empty handle.
    ///
    /// # Safety
    ///
    /// `raw` must be null or point to a live object.
    pub unsafe fn retain(raw: *mut T) -> Self {
        let ptr = NonNull::new(raw);
        if let Some(ptr) = ptr {
            T::add_ref(ptr);
        }
        Self { ptr }
    }

    /// Whether the handle owns an object
    pub fn is_present(&self) -> bool {
        self.ptr.is_some()
    }

    /// Whether the handle is empty
    pub fn is_empty(&self) -> bool {
        self.ptr.is_none()
    }

    /// Non-owning raw pointer for registry calls; null for an empty handle.
    ///
    /// The pointer is only valid while this handle is alive.
    pub fn as_raw(&self) -> *mut T {
        self.ptr.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// The wrapped pointer, or `NotPresent` for an empty handle
    pub fn as_non_null(&self) -> Result<NonNull<T>> {
        self.ptr.ok_or(WatchError::NotPresent("registry handle"))
    }

    /// Borrow the object without taking a reference
    pub fn borrow(&self) -> Option<Borrowed<'_, T>> {
        self.ptr.map(|ptr| Borrowed {
            ptr,
            _owner: PhantomData,
        })
    }

    /// Give up the reference held by this handle, leaving it empty
    pub fn reset(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            unsafe { T::release(ptr) };
        }
    }
}

impl<T: RefCounted> Clone for Handle<T> {
    fn clone(&self) -> Self {
        if let Some(ptr) = self.ptr {
            unsafe { T::add_ref(ptr) };
        }
        Self { ptr: self.ptr }
    }

    fn clone_from(&mut self, source: &Self) {
        if self.ptr == source.ptr {
            return;
        }
        self.reset();
        *self = source.clone();
    }
}

impl<T: RefCounted> Drop for Handle<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: RefCounted> Default for Handle<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: RefCounted> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ptr {
            Some(ptr) => write!(f, "Handle({:p})", ptr.as_ptr()),
            None => write!(f, "Handle(empty)"),
        }
    }
}

/// Non-owning view of a registry object whose lifetime is tied to `'a`
///
/// Returned for parent lookups: the registry keeps the parent alive only as
/// long as the child. Use [`Borrowed::to_owned`] to keep it longer.
pub struct Borrowed<'a, T: RefCounted> {
    ptr: NonNull<T>,
    _owner: PhantomData<&'a T>,
}

impl<'a, T: RefCounted> Borrowed<'a, T> {
    /// Wrap a borrowed pointer; null yields `None`.
    ///
    /// # Safety
    ///
    /// `raw` must be null or stay valid for `'a`.
    pub unsafe fn new(raw: *mut T) -> Option<Self> {
        NonNull::new(raw).map(|ptr| Self {
            ptr,
            _owner: PhantomData,
        })
    }

    /// The raw pointer, valid for `'a`
    pub fn as_non_null(&self) -> NonNull<T> {
        self.ptr
    }

    /// Take a reference of our own so the object can outlive `'a`
    pub fn to_owned(&self) -> Handle<T> {
        unsafe { Handle::retain(self.ptr.as_ptr()) }
    }
}

impl<T: RefCounted> Clone for Borrowed<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: RefCounted> Copy for Borrowed<'_, T> {}

impl<T: RefCounted> fmt::Debug for Borrowed<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Borrowed({:p})", self.ptr.as_ptr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Heap object that frees itself when its count reaches zero
    struct Counted {
        refs: Cell<usize>,
        increments: Rc<Cell<usize>>,
        frees: Rc<Cell<usize>>,
    }

    impl RefCounted for Counted {
        unsafe fn add_ref(ptr: NonNull<Self>) {
            let counted = ptr.as_ref();
            counted.refs.set(counted.refs.get() + 1);
            counted.increments.set(counted.increments.get() + 1);
        }

        unsafe fn release(ptr: NonNull<Self>) {
            let counted = ptr.as_ref();
            let left = counted.refs.get() - 1;
            counted.refs.set(left);
            if left == 0 {
                counted.frees.set(counted.frees.get() + 1);
                drop(Box::from_raw(ptr.as_ptr()));
            }
        }
    }

    struct Tally {
        increments: Rc<Cell<usize>>,
        frees: Rc<Cell<usize>>,
    }

    /// A fresh object carrying one reference, as a `*_new` call returns it
    fn fresh() -> (*mut Counted, Tally) {
        let increments = Rc::new(Cell::new(0));
        let frees = Rc::new(Cell::new(0));
        let raw = Box::into_raw(Box::new(Counted {
            refs: Cell::new(1),
            increments: Rc::clone(&increments),
            frees: Rc::clone(&frees),
        }));
        (raw, Tally { increments, frees })
    }

    fn refs(raw: *mut Counted) -> usize {
        unsafe { (*raw).refs.get() }
    }

    #[test]
    fn test_acquire_does_not_increment() {
        let (raw, tally) = fresh();
        let handle = unsafe { Handle::acquire(raw) };
        assert!(handle.is_present());
        assert_eq!(refs(raw), 1);
        assert_eq!(tally.increments.get(), 0);

        drop(handle);
        assert_eq!(tally.frees.get(), 1);
    }

    #[test]
    fn test_clone_and_drop_balance() {
        let (raw, tally) = fresh();
        let first = unsafe { Handle::acquire(raw) };
        let second = first.clone();
        let third = second.clone();
        assert_eq!(refs(raw), 3);

        drop(first);
        drop(third);
        assert_eq!(refs(raw), 1);
        assert_eq!(tally.frees.get(), 0);

        drop(second);
        assert_eq!(tally.frees.get(), 1);
        assert_eq!(tally.increments.get(), 2);
    }

    #[test]
    fn test_retain_increments() {
        let (raw, tally) = fresh();
        let owner = unsafe { Handle::acquire(raw) };
        let retained = unsafe { Handle::retain(raw) };
        assert_eq!(refs(raw), 2);

        // The retained reference keeps the object alive after the owner goes
        drop(owner);
        assert_eq!(tally.frees.get(), 0);
        assert_eq!(refs(retained.as_raw()), 1);

        drop(retained);
        assert_eq!(tally.frees.get(), 1);
    }

    #[test]
    fn test_borrowed_to_owned() {
        let (raw, tally) = fresh();
        let owner = unsafe { Handle::acquire(raw) };
        let owned = {
            let view = owner.borrow().unwrap();
            assert_eq!(refs(raw), 1);
            view.to_owned()
        };
        assert_eq!(refs(raw), 2);

        drop(owner);
        drop(owned);
        assert_eq!(tally.frees.get(), 1);
        assert_eq!(tally.increments.get(), 1);
    }

    #[test]
    fn test_clone_from_releases_old_reference() {
        let (raw_a, tally_a) = fresh();
        let (raw_b, tally_b) = fresh();
        let mut target = unsafe { Handle::acquire(raw_a) };
        let source = unsafe { Handle::acquire(raw_b) };

        target.clone_from(&source);
        assert_eq!(tally_a.frees.get(), 1);
        assert_eq!(refs(raw_b), 2);

        // Assigning the same object again must not drop it to zero first
        target.clone_from(&source);
        assert_eq!(refs(raw_b), 2);

        drop(target);
        drop(source);
        assert_eq!(tally_b.frees.get(), 1);
    }

    #[test]
    fn test_empty_handle_is_inert() {
        let handle: Handle<Counted> = unsafe { Handle::acquire(ptr::null_mut()) };
        assert!(handle.is_empty());
        assert!(handle.as_raw().is_null());
        assert!(handle.borrow().is_none());
        assert!(matches!(
            handle.as_non_null(),
            Err(WatchError::NotPresent(_))
        ));

        let copy = handle.clone();
        assert!(copy.is_empty());

        let retained: Handle<Counted> = unsafe { Handle::retain(ptr::null_mut()) };
        assert!(retained.is_empty());
        assert!(unsafe { Borrowed::<Counted>::new(ptr::null_mut()) }.is_none());
    }

    #[test]
    fn test_reset_releases_once() {
        let (raw, tally) = fresh();
        let mut handle = unsafe { Handle::acquire(raw) };
        handle.reset();
        assert!(handle.is_empty());
        assert_eq!(tally.frees.get(), 1);

        handle.reset();
        drop(handle);
        assert_eq!(tally.frees.get(), 1);
    }

    #[test]
    fn test_net_delta_over_mixed_sequence() {
        let (raw, tally) = fresh();
        let root = unsafe { Handle::acquire(raw) };
        let mut live = vec![root];
        for step in 0..20 {
            if step % 3 == 2 {
                live.pop();
            } else if step % 2 == 0 {
                live.push(live[0].clone());
            } else {
                live.push(unsafe { Handle::retain(raw) });
            }
            if live.is_empty() {
                break;
            }
            assert_eq!(refs(raw), live.len());
        }
        drop(live);
        assert_eq!(tally.frees.get(), 1);
    }
}
