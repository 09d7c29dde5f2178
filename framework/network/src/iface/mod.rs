/*! The transport interface.

Everything between the phy device and the dispatcher: identifier
classification, alias defense, multi-frame assembly, login and outbound
fragmentation.
*/

mod alias_map;
mod assembler;
mod fragmenter;
mod interface;
mod login;

pub use self::alias_map::{AliasMap, Mapping};
pub use self::assembler::{Assembler, AssemblyError, Position};
pub use self::fragmenter::Fragmenter;
pub use self::interface::{Callbacks, Interface};
