use std::fmt::Debug;
use std::io::Cursor;

use crate::protocol::api_version::ApiVersion;

use super::{ReadVersionedType, WriteVersionedType};

/// Write `orig` at `version`, read it back, and require byte-exact
/// consumption plus structural equality.
pub(crate) fn test_versioned_roundtrip<T>(orig: T, version: ApiVersion)
where
    T: WriteVersionedType<Vec<u8>> + ReadVersionedType<Cursor<Vec<u8>>> + PartialEq + Debug,
{
    let mut buf = vec![];
    orig.write_versioned(&mut buf, version).unwrap();

    let len = buf.len() as u64;
    let mut cursor = Cursor::new(buf);
    let restored = T::read_versioned(&mut cursor, version).unwrap();

    assert_eq!(orig, restored);
    assert_eq!(cursor.position(), len);
}
