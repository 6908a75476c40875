use std::fmt::{Debug, Formatter};

use crate::name_of;

use super::{Error, Result};

/// Wire identifier for an entry in a [`TokenTable`]. Packs a slot index in
/// the low half and a generation counter in the high half, so a token that
/// outlives its entry can never resolve to a different live entry.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct Token(u32);

impl Token {
    /// Token value that no table ever allocates.
    pub const NULL: Self = Self(u32::MAX);

    #[inline]
    #[must_use]
    const fn new(index: u16, generation: u16) -> Self {
        Self((generation as u32) << 16 | index as u32)
    }

    #[inline]
    #[must_use]
    const fn index(self) -> usize {
        self.0 as u16 as usize
    }

    #[inline]
    #[must_use]
    const fn generation(self) -> u16 {
        (self.0 >> 16) as u16
    }
}

impl Debug for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#010X})", name_of!(Token), self.0)
    }
}

impl From<Token> for u32 {
    #[inline]
    fn from(t: Token) -> Self {
        t.0
    }
}

impl From<u32> for Token {
    #[inline]
    fn from(v: u32) -> Self {
        Self(v)
    }
}

#[derive(Debug)]
enum Entry<T> {
    /// Freed slot. The generation is the one the next occupant will use.
    Free { generation: u16, next: Option<u16> },
    Live { generation: u16, val: T },
}

/// Slab keeping local state for references handed to the remote core.
/// Replaces raw pointer identity with index + generation tokens.
#[derive(Debug)]
pub struct TokenTable<T> {
    entries: Vec<Entry<T>>,
    free: Option<u16>,
    live: usize,
    cap: usize,
}

impl<T> TokenTable<T> {
    /// Creates a table holding at most `cap` live entries.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        // Index u16::MAX would collide with Token::NULL
        assert!(cap < usize::from(u16::MAX));
        Self {
            entries: Vec::new(),
            free: None,
            live: 0,
            cap,
        }
    }

    /// Inserts `val` and returns its token. Fails with [`Error::NoMem`] when
    /// the table is full.
    pub fn insert(&mut self, val: T) -> Result<Token> {
        if self.live >= self.cap {
            return Err(Error::NoMem);
        }
        self.live += 1;
        if let Some(i) = self.free {
            let e = &mut self.entries[usize::from(i)];
            let &mut Entry::Free { generation, next } = e else {
                unreachable!("corrupt free list");
            };
            *e = Entry::Live { generation, val };
            self.free = next;
            Ok(Token::new(i, generation))
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let i = self.entries.len() as u16;
            self.entries.push(Entry::Live { generation: 0, val });
            Ok(Token::new(i, 0))
        }
    }

    /// Resolves a token to a reference, or `None` if the entry was removed.
    #[must_use]
    pub fn get(&self, t: Token) -> Option<&T> {
        match self.entries.get(t.index()) {
            Some(&Entry::Live { generation, ref val }) if generation == t.generation() => {
                Some(val)
            }
            _ => None,
        }
    }

    /// Removes the entry for `t`, returning its value. Stale tokens return
    /// `None` and leave the table unchanged.
    pub fn remove(&mut self, t: Token) -> Option<T> {
        let i = t.index();
        match self.entries.get(i) {
            Some(&Entry::Live { generation, .. }) if generation == t.generation() => {}
            _ => return None,
        }
        let free = Entry::Free {
            generation: t.generation().wrapping_add(1),
            next: self.free,
        };
        let Entry::Live { val, .. } = std::mem::replace(&mut self.entries[i], free) else {
            unreachable!();
        };
        #[allow(clippy::cast_possible_truncation)]
        {
            self.free = Some(i as u16);
        }
        self.live -= 1;
        Some(val)
    }

    /// Returns a clone of the entry for `t`.
    #[inline]
    #[must_use]
    pub fn get_cloned(&self, t: Token) -> Option<T>
    where
        T: Clone,
    {
        self.get(t).cloned()
    }

    /// Returns the number of live entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}
