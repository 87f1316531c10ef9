//! # TickScript Data Engine
//!
//! Pure, copy-on-write operations over nested map/list trees addressed by
//! string paths.
//!
//! ## Path Expressions
//!
//! ```text
//! path    := segment ('.' segment)*
//! segment := identifier ('[' integer ']')?
//! ```
//!
//! `players[2].inventory` addresses key `players`, index 2, key `inventory`.
//! There is no escaping: a key containing a literal `.` or `[` cannot be
//! addressed.
//!
//! ## Sharing
//!
//! Lists and maps inside a [`DataValue`] are reference counted. `set`,
//! `delete` and `merge` clone only the nodes on the walked path, so the
//! returned tree shares every untouched subtree with its input and the
//! input is never modified.

pub mod value;
pub mod path;
pub mod engine;

pub use value::{DataMap, DataValue};
pub use path::{PathExpression, Segment};
pub use engine::{delete, get, has, merge, set, try_set, DataError, MAX_PADDING};
