//! An ordered collection of byte-string entries, backed by a skiplist whose
//! entry bytes live in a bump arena.
//!
//! The concurrency contract is the classic one for LSM memtables: any number
//! of readers may traverse the list while at most one writer inserts. Writers
//! are serialized by an internal mutex (in the engine they are additionally
//! serialized by the database mutex, so that lock is never contended), and
//! publish new nodes with release stores; readers follow `next` pointers with
//! acquire loads. Nodes and entry bytes are never freed or moved until the
//! whole list drops, so a reader can hold an entry slice for as long as it
//! holds the list.

mod arena;
mod list;

pub use self::arena::Arena;
pub use self::list::{Iter, KeyComparator, OwnedIter, Skiplist};
