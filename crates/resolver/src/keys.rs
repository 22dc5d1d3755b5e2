//! Stable integer handles used in place of the pointer cycle
//! server ↔ connection ↔ query that the design notes call out: each is a key
//! into a channel- or server-owned [`slab::Slab`], playing the role of a
//! weak back-reference that can be cleared on detach without an `Rc`/`Weak`
//! dance.

use std::fmt;

macro_rules! slab_key {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub usize);

        impl From<usize> for $name {
            fn from(v: usize) -> Self {
                $name(v)
            }
        }

        impl From<$name> for usize {
            fn from(v: $name) -> usize {
                v.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

slab_key!(ServerKey);
slab_key!(ConnKey);
slab_key!(QueryKey);
