pub mod entries;
pub mod hints;
pub mod resolver;
pub mod scope;

pub use entries::{PluginEntries, PluginEntry};
pub use hints::PackageHints;
pub use resolver::{PluginDescriptor, PluginResolver};
pub use scope::{PluginAccessError, PluginScope};
