/**
 * Cryptographic types and operations.
 *  - Public and Private key implementations
 *  - Key-to-key key sharing
 *  - Chunked body encryption
 */
pub mod crypto;
/**
 * Local SQLite index of decrypted headers,
 *  sync watermarks and zone key tables.
 */
pub mod index;
/**
 * The safe: zones, permission chains, key epochs
 *  and the put/get pipeline over a blob store.
 */
pub mod safe;

pub mod prelude {
    pub use crate::crypto::{PublicKey, SecretKey};
    pub use crate::index::{Index, ListOptions, OrderBy};
    pub use crate::safe::{
        AccessToken, Command, GetOptions, GetTask, Header, Permission, PutOptions, Safe,
        SafeBuilder, SafeConfig, SafeError, Users, Zone,
    };
}
