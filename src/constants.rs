//! Application-wide constants
//!
//! Wire-format codes, file names and environment variables used throughout
//! the store and its backends, kept in one place so the on-disk formats
//! have a single source of truth.

/// Metadata encoding (`"[<type>,<flag>]"`)
pub mod meta {
    pub const OPEN: char = '[';
    pub const CLOSE: char = ']';
    pub const SEPARATOR: char = ',';

    pub const TYPE_STRING: &str = "s";
    pub const TYPE_BOOLEAN: &str = "b";
    pub const TYPE_INT: &str = "i";
    pub const TYPE_RECTANGLE: &str = "r";
    pub const TYPE_POINT: &str = "p";
    pub const TYPE_ARRAY: &str = "a";

    /// Object type code prefix, followed by the class name (`o:com.example.Foo`)
    pub const TYPE_OBJECT_PREFIX: &str = "o:";

    /// No flags set
    pub const FLAG_NONE: &str = "n";

    /// Entry survives a reset to defaults
    pub const FLAG_NO_RESET: &str = "r";
}

/// Flat key-value backend naming
pub mod flat {
    /// Suffix of the entry holding the encoded value
    pub const DATA_SUFFIX: &str = ".data";

    /// Suffix of the entry holding the encoded metadata
    pub const META_SUFFIX: &str = ".meta";

    /// Per-node file used by the file-backed namespace
    pub const NODE_FILENAME: &str = "prefs.json";

    /// Node path separator
    pub const PATH_SEPARATOR: char = '/';
}

/// Tree backend document shape
pub mod tree {
    pub const PREFERENCES: &str = "preferences";
    pub const ROOT: &str = "root";
    pub const ROOT_TYPE_ATTR: &str = "type";
    pub const ROOT_TYPE_USER: &str = "user";
    pub const NODE: &str = "node";
    pub const NODE_NAME_ATTR: &str = "name";
    pub const MAP: &str = "map";
    pub const ENTRY: &str = "entry";
    pub const KEY_ATTR: &str = "key";
    pub const VALUE_ATTR: &str = "value";
    pub const META_ATTR: &str = "meta";

    /// Indentation width of the serialized document
    pub const INDENT: usize = 2;

    /// Extension of the backup kept when a document fails to parse
    pub const CORRUPT_EXTENSION: &str = "xml.corrupt";
}

/// Runtime configuration (environment and default locations)
pub mod config {
    /// Directory under the platform config dir
    pub const APP_DIR: &str = "prefstore";

    /// Default tree backend file
    pub const XML_FILENAME: &str = "preferences.xml";

    /// Default flat namespace root directory
    pub const NODES_DIR: &str = "nodes";

    /// Default node path
    pub const DEFAULT_PATH: &str = "default";

    pub const ENV_BACKEND: &str = "PREFSTORE_BACKEND";
    pub const ENV_FILE: &str = "PREFSTORE_FILE";
    pub const ENV_ROOT: &str = "PREFSTORE_ROOT";
    pub const ENV_PATH: &str = "PREFSTORE_PATH";
    pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
}
