//! Intrusive doubly linked list backed by a container implementing
//! `core::ops::Index`.
//!
//! Lists are circular: the head points to the first element, and the first
//! element's `prev` link points to the last element. A corrupted link
//! structure is a kernel invariant violation and trips an assertion instead
//! of being reported to the caller.
#![allow(dead_code)]
use core::{fmt, ops};

use super::Init;

/// Circular linked list header.
#[derive(Copy, Clone)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
}

impl<Index> Default for ListHead<Index> {
    fn default() -> Self {
        Self::INIT
    }
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

impl<Index> Init for ListHead<Index> {
    const INIT: Self = Self { first: None };
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self::INIT
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

/// A virtual container of `T`s that can be indexed by `Ident<&'static T>`.
#[derive(Debug, Clone, Copy)]
pub struct Static;

impl<T> ops::Index<Ident<&'static T>> for Static {
    type Output = T;

    #[inline]
    fn index(&self, index: Ident<&'static T>) -> &Self::Output {
        index.0
    }
}

/// A virtual container whose element pointees are assumed to be valid.
///
/// Used to access list elements that are transient objects (e.g., wait and
/// timeout objects living on a blocked task's stack).
pub struct UnsafeStatic {
    _nonexhaustive: (),
}

impl UnsafeStatic {
    /// Construct an `UnsafeStatic`.
    ///
    /// # Safety
    ///
    /// All pointees to be accessed through the constructed `UnsafeStatic`
    /// must be valid.
    #[inline]
    pub const unsafe fn new() -> &'static Self {
        &Self { _nonexhaustive: () }
    }
}

/// Reference wrapper that implements `PartialEq` and `Eq` by identity
/// comparison.
#[derive(Clone, Copy)]
pub struct Ident<T>(pub T);

impl<T> fmt::Debug for Ident<&'_ T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Do not print the pointee. This is a safe measure against infinite
        // recursion.
        f.debug_tuple("Ident").field(&(self.0 as *const T)).finish()
    }
}

impl<T: ?Sized> PartialEq for Ident<&'_ T> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}

impl<T: ?Sized> Eq for Ident<&'_ T> {}

/// Circular linked list header where elements are linked by
/// [`StaticLink`]`<Element>` (a pair of `&'static Element`).
pub type StaticListHead<Element> = ListHead<Ident<&'static Element>>;

/// Links to neighbor items with a `'static` lifetime.
pub type StaticLink<Element> = Link<Ident<&'static Element>>;

/// An abstract interface to a mutable cell, unlocked by a key of type `Key`.
pub trait CellLike<Key> {
    type Target;

    fn get(&self, key: &Key) -> Self::Target;
    fn set(&self, key: &mut Key, value: Self::Target);

    #[inline]
    fn modify<T>(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T
    where
        Self: Sized,
    {
        let mut x = self.get(key);
        let ret = f(&mut x);
        self.set(key, x);
        ret
    }
}

impl<Element: Copy> CellLike<()> for core::cell::Cell<Element> {
    type Target = Element;

    fn get(&self, _: &()) -> Self::Target {
        self.get()
    }
    fn set(&self, _: &mut (), value: Self::Target) {
        self.set(value);
    }
}

impl<'a, Element: Clone, I, Key> CellLike<&'a mut Key> for tokenlock::UnsyncTokenLock<Element, I>
where
    Key: tokenlock::Token<I> + tokenlock::Unsync,
{
    type Target = Element;

    fn get(&self, key: &&'a mut Key) -> Self::Target {
        self.read(*key).clone()
    }
    fn set(&self, key: &mut &'a mut Key, value: Self::Target) {
        self.replace(*key, value);
    }
    fn modify<T>(&self, key: &mut &'a mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T {
        let x = self.write(*key);
        f(x)
    }
}

impl<Key, Element: CellLike<Key>> CellLike<Key> for &Element {
    type Target = Element::Target;

    fn get(&self, key: &Key) -> Self::Target {
        (*self).get(key)
    }
    fn set(&self, key: &mut Key, value: Self::Target) {
        (*self).set(key, value);
    }
    fn modify<T>(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T {
        (*self).modify(key, f)
    }
}

/// Trip the invariant-violation path. List corruption is a programmer error
/// and is never reported to application code.
#[cold]
#[inline(never)]
fn inconsistent() -> ! {
    panic!("linked list is structurally inconsistent");
}

/// `Cell`-based accessor to a linked list.
pub struct ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey> {
    head: HeadCell,
    pool: &'a Pool,
    map_link: MapLink,
    /// `Key` used to read or write cells.
    cell_key: CellKey,
}

impl<'a, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey>
    ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: Fn(&Element) -> &LinkCell,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    pub fn new(head: HeadCell, pool: &'a Pool, map_link: MapLink, cell_key: CellKey) -> Self {
        ListAccessorCell {
            head,
            pool,
            map_link,
            cell_key,
        }
    }

    pub fn head(&self) -> ListHead<Index> {
        self.head.get(&self.cell_key)
    }

    pub fn set_head(&mut self, head: ListHead<Index>) {
        self.head.set(&mut self.cell_key, head);
    }

    pub fn pool(&self) -> &Pool {
        self.pool
    }

    pub fn cell_key(&self) -> &CellKey {
        &self.cell_key
    }

    pub fn is_empty(&self) -> bool {
        self.head().is_empty()
    }

    #[inline]
    fn link(&self, index: Index) -> Option<Link<Index>> {
        (self.map_link)(&self.pool[index]).get(&self.cell_key)
    }

    #[inline]
    fn link_or_inconsistent(&self, index: Index) -> Link<Index> {
        match self.link(index) {
            Some(link) => link,
            None => inconsistent(),
        }
    }

    #[inline]
    pub fn front(&self) -> Option<Index> {
        self.head().first
    }

    #[inline]
    pub fn back(&self) -> Option<Index> {
        self.head()
            .first
            .map(|first| self.link_or_inconsistent(first).prev)
    }

    #[inline]
    pub fn front_data(&self) -> Option<&Element> {
        self.front().map(|p| &self.pool[p])
    }

    #[inline]
    pub fn back_data(&self) -> Option<&Element> {
        self.back().map(|p| &self.pool[p])
    }

    /// Insert `item` before the position `p` (if `at` is `Some(p)`) or to
    /// the list's back (if `at` is `None`).
    ///
    /// `item` must not be already linked.
    pub fn insert(&mut self, item: Index, at: Option<Index>) {
        if self.link(item.clone()).is_some() {
            inconsistent();
        }

        let mut head = self.head();

        if let Some(first) = head.first {
            let (next, update_first) = if let Some(at) = at {
                let update_first = at == first;
                (at, update_first)
            } else {
                (first, false)
            };

            let prev = self.link_or_inconsistent(next.clone()).prev;

            // prev.next = item
            (self.map_link)(&self.pool[prev.clone()]).modify(&mut self.cell_key, |l| match l {
                Some(l) => l.next = item.clone(),
                None => inconsistent(),
            });

            // next.prev = item
            (self.map_link)(&self.pool[next.clone()]).modify(&mut self.cell_key, |l| match l {
                Some(l) => l.prev = item.clone(),
                None => inconsistent(),
            });

            // item.prev = prev
            // item.next = next
            (self.map_link)(&self.pool[item.clone()])
                .set(&mut self.cell_key, Some(Link { prev, next }));

            if update_first {
                head.first = Some(item);
                self.set_head(head);
            }
        } else {
            debug_assert!(at.is_none());

            let link = (self.map_link)(&self.pool[item.clone()]);
            link.set(
                &mut self.cell_key,
                Some(Link {
                    prev: item.clone(),
                    next: item.clone(),
                }),
            );

            head.first = Some(item);
            self.set_head(head);
        }
    }

    #[inline]
    pub fn push_back(&mut self, item: Index) {
        self.insert(item, None);
    }

    #[inline]
    pub fn push_front(&mut self, item: Index) {
        let at = self.front();
        self.insert(item, at);
    }

    /// Remove `item` from the list. `item` must be linked.
    pub fn remove(&mut self, item: Index) {
        let link = {
            let link_ref = (self.map_link)(&self.pool[item.clone()]);
            let mut head = self.head();
            if head.first.as_ref() == Some(&item) {
                let next = match link_ref.get(&self.cell_key) {
                    Some(link) => link.next,
                    None => inconsistent(),
                };

                if next == item {
                    // The list just became empty
                    head.first = None;
                    self.set_head(head);

                    link_ref.set(&mut self.cell_key, None);
                    return;
                }

                // Move the head pointer
                head.first = Some(next);
                self.set_head(head);
            }

            match link_ref.get(&self.cell_key) {
                Some(link) => link,
                None => inconsistent(),
            }
        };

        // link.prev.next = link.next
        (self.map_link)(&self.pool[link.prev.clone()]).modify(&mut self.cell_key, |l| match l {
            Some(l) => l.next = link.next.clone(),
            None => inconsistent(),
        });

        // link.next.prev = link.prev
        (self.map_link)(&self.pool[link.next.clone()]).modify(&mut self.cell_key, |l| match l {
            Some(l) => l.prev = link.prev.clone(),
            None => inconsistent(),
        });

        // item.prev = null
        // item.next = null
        (self.map_link)(&self.pool[item]).set(&mut self.cell_key, None);
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<Index> {
        let first = self.front();
        if let Some(first) = first.clone() {
            self.remove(first);
        }
        first
    }

    #[inline]
    pub fn pop_back(&mut self) -> Option<Index> {
        let last = self.back();
        if let Some(last) = last.clone() {
            self.remove(last);
        }
        last
    }

    /// Get the next element of the specified element. The element must be
    /// linked.
    #[inline]
    pub fn next(&self, i: Index) -> Option<Index> {
        let next = self.link_or_inconsistent(i).next;
        if Some(&next) == self.head().first.as_ref() {
            None
        } else {
            Some(next)
        }
    }

    /// Get the previous element of the specified element. The element must
    /// be linked.
    #[inline]
    pub fn prev(&self, i: Index) -> Option<Index> {
        if Some(&i) == self.head().first.as_ref() {
            None
        } else {
            Some(self.link_or_inconsistent(i).prev)
        }
    }

    pub fn iter(&self) -> Iter<'_, Self, Index> {
        Iter {
            next: self.head().first,
            accessor: self,
        }
    }
}

/// An iterator over the elements of [`ListAccessorCell`].
pub struct Iter<'b, Accessor, Index> {
    accessor: &'b Accessor,
    next: Option<Index>,
}

impl<'a, 'b, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey> Iterator
    for Iter<'b, ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>, Index>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: Fn(&Element) -> &LinkCell,
    Element: 'a,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
    'a: 'b,
{
    type Item = (Index, &'b Element);

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(next) = self.next.take() {
            self.next = self.accessor.next(next.clone());
            Some((next.clone(), &self.accessor.pool[next]))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::{cell::Cell, collections::VecDeque, vec::Vec};

    fn push<Element>(this: &mut Vec<Element>, x: Element) -> usize {
        let i = this.len();
        this.push(x);
        i
    }

    macro_rules! get_accessor {
        ($head:expr, $pool:expr) => {
            ListAccessorCell::new($head, $pool, |(_, link): &(i32, _)| link, ())
        };
    }

    #[test]
    fn basic_cell() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        let ptr1 = push(&mut pool, (1, Cell::new(None)));
        get_accessor!(&head, &pool).push_back(ptr1);

        let ptr2 = push(&mut pool, (2, Cell::new(None)));
        get_accessor!(&head, &pool).push_back(ptr2);

        let ptr3 = push(&mut pool, (3, Cell::new(None)));
        get_accessor!(&head, &pool).push_front(ptr3);

        let mut accessor = get_accessor!(&head, &pool);
        assert!(!accessor.is_empty());
        assert_eq!(accessor.front(), Some(ptr3));
        assert_eq!(accessor.back(), Some(ptr2));
        assert_eq!(accessor.front_data().unwrap().0, 3);
        assert_eq!(accessor.back_data().unwrap().0, 2);

        let items: Vec<_> = accessor.iter().map(|(_, (x, _))| *x).collect();
        assert_eq!(items, vec![3, 1, 2]);

        assert_eq!(accessor.next(ptr3), Some(ptr1));
        assert_eq!(accessor.next(ptr1), Some(ptr2));
        assert_eq!(accessor.next(ptr2), None);
        assert_eq!(accessor.prev(ptr3), None);
        assert_eq!(accessor.prev(ptr1), Some(ptr3));
        assert_eq!(accessor.prev(ptr2), Some(ptr1));

        accessor.remove(ptr1);
        accessor.remove(ptr2);
        accessor.remove(ptr3);

        assert!(accessor.is_empty());
    }

    #[test]
    fn insert_before() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        let ptr1 = push(&mut pool, (1, Cell::new(None)));
        let ptr2 = push(&mut pool, (2, Cell::new(None)));
        let ptr3 = push(&mut pool, (3, Cell::new(None)));

        get_accessor!(&head, &pool).push_back(ptr1);
        get_accessor!(&head, &pool).push_back(ptr3);
        get_accessor!(&head, &pool).insert(ptr2, Some(ptr3));

        let accessor = get_accessor!(&head, &pool);
        let items: Vec<_> = accessor.iter().map(|(_, (x, _))| *x).collect();
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[test]
    fn clear_cell() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        let ptrs = [
            push(&mut pool, (1, Cell::new(None))),
            push(&mut pool, (2, Cell::new(None))),
            push(&mut pool, (3, Cell::new(None))),
        ];

        get_accessor!(&head, &pool).push_back(ptrs[0]);
        get_accessor!(&head, &pool).push_back(ptrs[1]);
        get_accessor!(&head, &pool).push_front(ptrs[2]);

        while get_accessor!(&head, &pool).pop_front().is_some() {}

        assert_eq!(head.get().first, None);
        for &ptr in &ptrs {
            let e = &pool[ptr];
            assert!(e.1.get().is_none());
        }
    }

    /// Compare the list against a `VecDeque` model under a random sequence
    /// of push/pop operations.
    #[quickcheck]
    fn model_check(bytecode: Vec<u8>) {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());
        for i in 0..8 {
            push(&mut pool, (i as i32, Cell::new(None)));
        }

        let mut model: VecDeque<usize> = VecDeque::new();

        for instr in bytecode {
            let op = instr % 4;
            let operand = (instr / 4) as usize % pool.len();
            let mut accessor = get_accessor!(&head, &pool);
            match op {
                0 => {
                    if !model.contains(&operand) {
                        accessor.push_back(operand);
                        model.push_back(operand);
                    }
                }
                1 => {
                    if !model.contains(&operand) {
                        accessor.push_front(operand);
                        model.push_front(operand);
                    }
                }
                2 => {
                    assert_eq!(accessor.pop_front(), model.pop_front());
                }
                _ => {
                    if let Some(pos) = model.iter().position(|&x| x == operand) {
                        accessor.remove(operand);
                        model.remove(pos);
                    }
                }
            }

            let accessor = get_accessor!(&head, &pool);
            let items: Vec<usize> = accessor.iter().map(|(i, _)| i).collect();
            let expected: Vec<usize> = model.iter().cloned().collect();
            assert_eq!(items, expected);
        }
    }
}
