//! Query fingerprints.
//!
//! A [`QueryFingerprint`] is the canonical, wire-transferable form of a
//! query predicate. Its [`identify`](QueryFingerprint::identify) string keys
//! subscriptions and deduplicates them across peers.
//!
//! Identity is computed over the predicate nodes in insertion order. Two
//! logically equivalent predicates built in a different order produce
//! different identities.

use crate::error::{ProtocolError, ProtocolResult};
use replidb_codec::{len, ParcelReader, ParcelWriter, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Magic number leading every serialized fingerprint.
pub const QUERY_SYNC_OBJECT_MAGIC: u32 = 0x5159_4f42;

/// Layout without table name and explicit keys.
pub const QUERY_SYNC_OBJECT_VERSION_0: u32 = 0;

/// Adds table name and explicit key set.
pub const QUERY_SYNC_OBJECT_VERSION_1: u32 = 1;

/// Newest fingerprint layout.
pub const QUERY_SYNC_OBJECT_VERSION_CURRENT: u32 = QUERY_SYNC_OBJECT_VERSION_1;

/// Maximum length of a key or prefix key.
pub const MAX_KEY_SIZE: usize = 1024;

/// Maximum number of explicit keys in one query.
pub const MAX_IN_KEYS: usize = 128;

/// Maximum number of predicate nodes.
pub const MAX_QUERY_NODES: usize = 256;

/// Maximum number of operands in one node.
pub const MAX_NODE_VALUES: usize = 128;

const MAX_NAME_LEN: usize = 256;

/// Predicate node operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum QueryOperator {
    /// `field == value`
    EqualTo = 1,
    /// `field != value`
    NotEqualTo = 2,
    /// `field > value`
    GreaterThan = 3,
    /// `field < value`
    LessThan = 4,
    /// `field >= value`
    GreaterThanOrEqualTo = 5,
    /// `field <= value`
    LessThanOrEqualTo = 6,
    /// SQL-style pattern match.
    Like = 7,
    /// Negated pattern match.
    NotLike = 8,
    /// Membership in a value list.
    In = 9,
    /// Non-membership in a value list.
    NotIn = 10,
    /// Field is null.
    IsNull = 11,
    /// Field is not null.
    IsNotNull = 12,
    /// Logical conjunction.
    And = 13,
    /// Logical disjunction.
    Or = 14,
    /// Opening parenthesis.
    BeginGroup = 15,
    /// Closing parenthesis.
    EndGroup = 16,
    /// Result ordering; not part of the identity.
    OrderBy = 17,
    /// Result limit; not part of the identity.
    Limit = 18,
}

impl QueryOperator {
    /// Decode an operator from its wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        use QueryOperator::*;
        Some(match value {
            1 => EqualTo,
            2 => NotEqualTo,
            3 => GreaterThan,
            4 => LessThan,
            5 => GreaterThanOrEqualTo,
            6 => LessThanOrEqualTo,
            7 => Like,
            8 => NotLike,
            9 => In,
            10 => NotIn,
            11 => IsNull,
            12 => IsNotNull,
            13 => And,
            14 => Or,
            15 => BeginGroup,
            16 => EndGroup,
            17 => OrderBy,
            18 => Limit,
            _ => return None,
        })
    }

    fn is_comparison(self) -> bool {
        matches!(
            self,
            QueryOperator::EqualTo
                | QueryOperator::NotEqualTo
                | QueryOperator::GreaterThan
                | QueryOperator::LessThan
                | QueryOperator::GreaterThanOrEqualTo
                | QueryOperator::LessThanOrEqualTo
                | QueryOperator::Like
                | QueryOperator::NotLike
        )
    }

    fn is_logic(self) -> bool {
        matches!(self, QueryOperator::And | QueryOperator::Or)
    }

    fn is_identity_relevant(self) -> bool {
        !matches!(self, QueryOperator::OrderBy | QueryOperator::Limit)
    }
}

/// One node of a predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryNode {
    /// Node operator.
    pub operator: QueryOperator,
    /// Field the node applies to; empty for logic and group nodes.
    pub field_name: String,
    /// Operands.
    pub values: Vec<Value>,
}

impl QueryNode {
    fn new(operator: QueryOperator, field_name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            operator,
            field_name: field_name.into(),
            values,
        }
    }

    fn parcel_len(&self) -> usize {
        len::U32
            + len::string(&self.field_name)
            + len::U32
            + self.values.iter().map(Value::parcel_len).sum::<usize>()
    }

    fn write_to(&self, writer: &mut ParcelWriter) {
        writer.write_u32(self.operator as u32);
        writer.write_string(&self.field_name);
        writer.write_u32(self.values.len() as u32);
        for value in &self.values {
            value.write_to(writer);
        }
    }

    fn read_from(reader: &mut ParcelReader<'_>) -> ProtocolResult<Self> {
        let raw = reader.read_u32();
        let field_name = reader.read_string("field name", MAX_NAME_LEN);
        let count = reader.read_u32() as usize;
        reader.status()?;
        let operator = QueryOperator::from_u32(raw)
            .ok_or_else(|| ProtocolError::parse_fail(format!("unknown query operator {raw}")))?;
        if count > MAX_NODE_VALUES {
            return Err(ProtocolError::LengthError(format!(
                "query node has {count} values, limit {MAX_NODE_VALUES}"
            )));
        }
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(Value::read_from(reader));
        }
        reader.status()?;
        Ok(Self {
            operator,
            field_name,
            values,
        })
    }
}

/// Canonical, immutable form of a query predicate.
///
/// Built with the consuming builder methods:
///
/// ```
/// use replidb_sync_protocol::QueryFingerprint;
///
/// let query = QueryFingerprint::new()
///     .prefix_key(b"user/")
///     .equal_to("age", 30i64)
///     .and()
///     .like("name", "a%")
///     .limit(10);
/// assert!(query.is_valid());
/// assert_eq!(query.identify().len(), 64);
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryFingerprint {
    prefix_key: Vec<u8>,
    suggested_index: String,
    nodes: Vec<QueryNode>,
    table_name: Option<String>,
    keys: BTreeSet<Vec<u8>>,
}

impl QueryFingerprint {
    /// Creates a query matching everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the query to keys starting with `prefix`.
    pub fn prefix_key(mut self, prefix: impl AsRef<[u8]>) -> Self {
        self.prefix_key = prefix.as_ref().to_vec();
        self
    }

    /// Hints the index the storage engine should use.
    pub fn suggest_index(mut self, index: impl Into<String>) -> Self {
        self.suggested_index = index.into();
        self
    }

    /// Restricts a relational query to one table. An empty name is ignored.
    pub fn table(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.table_name = if name.is_empty() { None } else { Some(name) };
        self
    }

    /// Restricts the query to an explicit key set.
    pub fn in_keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        self.keys = keys.into_iter().map(|k| k.as_ref().to_vec()).collect();
        self
    }

    /// Adds `field == value`.
    pub fn equal_to(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(QueryOperator::EqualTo, field, vec![value.into()])
    }

    /// Adds `field != value`.
    pub fn not_equal_to(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(QueryOperator::NotEqualTo, field, vec![value.into()])
    }

    /// Adds `field > value`.
    pub fn greater_than(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(QueryOperator::GreaterThan, field, vec![value.into()])
    }

    /// Adds `field < value`.
    pub fn less_than(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(QueryOperator::LessThan, field, vec![value.into()])
    }

    /// Adds `field >= value`.
    pub fn greater_than_or_equal_to(
        self,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.push(QueryOperator::GreaterThanOrEqualTo, field, vec![value.into()])
    }

    /// Adds `field <= value`.
    pub fn less_than_or_equal_to(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(QueryOperator::LessThanOrEqualTo, field, vec![value.into()])
    }

    /// Adds a `LIKE` pattern match.
    pub fn like(self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.push(QueryOperator::Like, field, vec![Value::Text(pattern.into())])
    }

    /// Adds a `NOT LIKE` pattern match.
    pub fn not_like(self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.push(QueryOperator::NotLike, field, vec![Value::Text(pattern.into())])
    }

    /// Adds `field IN (values)`.
    pub fn in_values(self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.push(QueryOperator::In, field, values)
    }

    /// Adds `field NOT IN (values)`.
    pub fn not_in_values(self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.push(QueryOperator::NotIn, field, values)
    }

    /// Adds `field IS NULL`.
    pub fn is_null(self, field: impl Into<String>) -> Self {
        self.push(QueryOperator::IsNull, field, Vec::new())
    }

    /// Adds `field IS NOT NULL`.
    pub fn is_not_null(self, field: impl Into<String>) -> Self {
        self.push(QueryOperator::IsNotNull, field, Vec::new())
    }

    /// Joins the surrounding conditions with `AND`.
    pub fn and(self) -> Self {
        self.push(QueryOperator::And, "", Vec::new())
    }

    /// Joins the surrounding conditions with `OR`.
    pub fn or(self) -> Self {
        self.push(QueryOperator::Or, "", Vec::new())
    }

    /// Opens a parenthesized group.
    pub fn begin_group(self) -> Self {
        self.push(QueryOperator::BeginGroup, "", Vec::new())
    }

    /// Closes a parenthesized group.
    pub fn end_group(self) -> Self {
        self.push(QueryOperator::EndGroup, "", Vec::new())
    }

    /// Orders results by `field`.
    pub fn order_by(self, field: impl Into<String>, ascending: bool) -> Self {
        self.push(QueryOperator::OrderBy, field, vec![Value::Bool(ascending)])
    }

    /// Limits the number of results.
    pub fn limit(self, count: i64) -> Self {
        self.push(QueryOperator::Limit, "", vec![Value::Integer(count)])
    }

    fn push(mut self, operator: QueryOperator, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.nodes.push(QueryNode::new(operator, field, values));
        self
    }

    /// Prefix key, empty when unrestricted.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix_key
    }

    /// Suggested index, empty when none.
    pub fn suggested_index(&self) -> &str {
        &self.suggested_index
    }

    /// Predicate nodes in insertion order.
    pub fn nodes(&self) -> &[QueryNode] {
        &self.nodes
    }

    /// Table name for relational queries.
    pub fn table_name(&self) -> Option<&str> {
        self.table_name.as_deref()
    }

    /// Explicit key set, empty when unrestricted.
    pub fn keys(&self) -> &BTreeSet<Vec<u8>> {
        &self.keys
    }

    /// Serialization layout version this fingerprint needs.
    pub fn version(&self) -> u32 {
        if self.table_name.is_some() || !self.keys.is_empty() {
            QUERY_SYNC_OBJECT_VERSION_1
        } else {
            QUERY_SYNC_OBJECT_VERSION_0
        }
    }

    /// Returns true if the predicate is well formed.
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Checks the predicate for structural errors.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.prefix_key.len() > MAX_KEY_SIZE {
            return Err(ProtocolError::invalid_args("prefix key too long"));
        }
        if self.keys.len() > MAX_IN_KEYS {
            return Err(ProtocolError::invalid_args("too many explicit keys"));
        }
        if self.keys.iter().any(|k| k.is_empty() || k.len() > MAX_KEY_SIZE) {
            return Err(ProtocolError::invalid_args("invalid explicit key"));
        }
        if self.nodes.len() > MAX_QUERY_NODES {
            return Err(ProtocolError::invalid_args("too many query nodes"));
        }

        let mut depth = 0usize;
        let mut expect_condition = true;
        let mut seen_limit = false;
        for node in &self.nodes {
            let op = node.operator;
            if seen_limit {
                return Err(ProtocolError::invalid_args("limit must be the last node"));
            }
            if node.values.len() > MAX_NODE_VALUES {
                return Err(ProtocolError::invalid_args("too many node values"));
            }
            match op {
                _ if op.is_comparison() => {
                    if !expect_condition || node.field_name.is_empty() || node.values.len() != 1 {
                        return Err(ProtocolError::invalid_args("malformed comparison"));
                    }
                    expect_condition = false;
                }
                QueryOperator::In | QueryOperator::NotIn => {
                    if !expect_condition || node.field_name.is_empty() || node.values.is_empty() {
                        return Err(ProtocolError::invalid_args("malformed membership test"));
                    }
                    expect_condition = false;
                }
                QueryOperator::IsNull | QueryOperator::IsNotNull => {
                    if !expect_condition || node.field_name.is_empty() || !node.values.is_empty() {
                        return Err(ProtocolError::invalid_args("malformed null test"));
                    }
                    expect_condition = false;
                }
                _ if op.is_logic() => {
                    if expect_condition {
                        return Err(ProtocolError::invalid_args("dangling logic operator"));
                    }
                    expect_condition = true;
                }
                QueryOperator::BeginGroup => {
                    if !expect_condition {
                        return Err(ProtocolError::invalid_args("group must follow a logic operator"));
                    }
                    depth += 1;
                }
                QueryOperator::EndGroup => {
                    if expect_condition || depth == 0 {
                        return Err(ProtocolError::invalid_args("unbalanced group"));
                    }
                    depth -= 1;
                }
                QueryOperator::OrderBy => {
                    if node.field_name.is_empty() {
                        return Err(ProtocolError::invalid_args("order by needs a field"));
                    }
                }
                QueryOperator::Limit => {
                    if node.values.len() != 1 || node.values[0].as_integer().is_none() {
                        return Err(ProtocolError::invalid_args("limit needs one integer"));
                    }
                    seen_limit = true;
                }
                _ => {}
            }
        }
        let has_condition = self
            .nodes
            .iter()
            .any(|n| !matches!(n.operator, QueryOperator::OrderBy | QueryOperator::Limit));
        if depth != 0 || (has_condition && expect_condition) {
            return Err(ProtocolError::invalid_args("incomplete predicate"));
        }
        Ok(())
    }

    /// Stable identity string used as the subscription key.
    ///
    /// Lowercase hex SHA-256 over the prefix key, suggested index, predicate
    /// nodes other than ordering and limit, table name and key set. Empty for
    /// an invalid predicate.
    pub fn identify(&self) -> String {
        if !self.is_valid() {
            return String::new();
        }
        let nodes: Vec<&QueryNode> = self
            .nodes
            .iter()
            .filter(|n| n.operator.is_identity_relevant())
            .collect();

        let mut total = len::bytes(self.prefix_key.len())
            + len::string(&self.suggested_index)
            + len::U32
            + nodes.iter().map(|n| n.parcel_len()).sum::<usize>();
        if let Some(table) = &self.table_name {
            total += len::string(table);
        }
        total += len::U32 + self.keys.iter().map(|k| len::bytes(k.len())).sum::<usize>();

        let mut writer = ParcelWriter::with_length(total);
        writer.write_bytes(&self.prefix_key);
        writer.write_string(&self.suggested_index);
        writer.write_u32(nodes.len() as u32);
        for node in nodes {
            node.write_to(&mut writer);
        }
        if let Some(table) = &self.table_name {
            writer.write_string(table);
        }
        writer.write_u32(self.keys.len() as u32);
        for key in &self.keys {
            writer.write_bytes(key);
        }

        let mut hasher = Sha256::new();
        hasher.update(writer.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns true if a key/value record with `key` falls inside this query.
    ///
    /// Only the key-space restrictions (prefix and explicit keys) are
    /// evaluated; field predicates are left to the storage engine.
    pub fn matches_key(&self, key: &[u8]) -> bool {
        key.starts_with(&self.prefix_key) && (self.keys.is_empty() || self.keys.contains(key))
    }

    /// Encoded length in bytes.
    pub fn parcel_len(&self) -> usize {
        let mut total = len::U32
            + len::U32
            + len::bytes(self.prefix_key.len())
            + len::string(&self.suggested_index)
            + len::U32
            + self.nodes.iter().map(QueryNode::parcel_len).sum::<usize>();
        if self.version() >= QUERY_SYNC_OBJECT_VERSION_1 {
            total += len::string(self.table_name.as_deref().unwrap_or(""));
            total += len::U32 + self.keys.iter().map(|k| len::bytes(k.len())).sum::<usize>();
        }
        len::align8(total)
    }

    /// Write this fingerprint to a parcel.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgs` for an invalid predicate, or the parcel error if
    /// a write failed.
    pub fn write_to(&self, writer: &mut ParcelWriter) -> ProtocolResult<()> {
        self.validate()?;
        let version = self.version();
        writer.write_u32(QUERY_SYNC_OBJECT_MAGIC);
        writer.write_u32(version);
        writer.write_bytes(&self.prefix_key);
        writer.write_string(&self.suggested_index);
        writer.write_u32(self.nodes.len() as u32);
        for node in &self.nodes {
            node.write_to(writer);
        }
        if version >= QUERY_SYNC_OBJECT_VERSION_1 {
            writer.write_string(self.table_name.as_deref().unwrap_or(""));
            writer.write_u32(self.keys.len() as u32);
            for key in &self.keys {
                writer.write_bytes(key);
            }
        }
        writer.align8();
        writer.status()?;
        Ok(())
    }

    /// Read a fingerprint from a parcel.
    ///
    /// # Errors
    ///
    /// Returns `VersionNotSupported` for a newer layout, `ParseFail` for a bad
    /// magic or operator, and `LengthError` when a bound is violated.
    pub fn read_from(reader: &mut ParcelReader<'_>) -> ProtocolResult<Self> {
        let magic = reader.read_u32();
        let version = reader.read_u32();
        reader.status()?;
        if magic != QUERY_SYNC_OBJECT_MAGIC {
            return Err(ProtocolError::parse_fail(format!(
                "bad query magic {magic:#x}"
            )));
        }
        if version > QUERY_SYNC_OBJECT_VERSION_CURRENT {
            return Err(ProtocolError::VersionNotSupported {
                version,
                current: QUERY_SYNC_OBJECT_VERSION_CURRENT,
            });
        }

        let prefix_key = reader.read_bytes("prefix key", MAX_KEY_SIZE);
        let suggested_index = reader.read_string("suggested index", MAX_NAME_LEN);
        let node_count = reader.read_u32() as usize;
        reader.status()?;
        if node_count > MAX_QUERY_NODES {
            return Err(ProtocolError::LengthError(format!(
                "query has {node_count} nodes, limit {MAX_QUERY_NODES}"
            )));
        }
        let mut nodes = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            nodes.push(QueryNode::read_from(reader)?);
        }

        let mut table_name = None;
        let mut keys = BTreeSet::new();
        if version >= QUERY_SYNC_OBJECT_VERSION_1 {
            let table = reader.read_string("table name", MAX_NAME_LEN);
            let key_count = reader.read_u32() as usize;
            reader.status()?;
            if key_count > MAX_IN_KEYS {
                return Err(ProtocolError::LengthError(format!(
                    "query has {key_count} keys, limit {MAX_IN_KEYS}"
                )));
            }
            for _ in 0..key_count {
                keys.insert(reader.read_bytes("key", MAX_KEY_SIZE));
            }
            if !table.is_empty() {
                table_name = Some(table);
            }
        }
        reader.align8();
        reader.status()?;

        Ok(Self {
            prefix_key,
            suggested_index,
            nodes,
            table_name,
            keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(query: &QueryFingerprint) -> QueryFingerprint {
        let mut writer = ParcelWriter::with_length(query.parcel_len());
        query.write_to(&mut writer).unwrap();
        let bytes = writer.finish().unwrap();
        let mut reader = ParcelReader::new(&bytes);
        let decoded = QueryFingerprint::read_from(&mut reader).unwrap();
        assert!(reader.is_empty());
        decoded
    }

    #[test]
    fn identity_ignores_limit_and_order() {
        let base = QueryFingerprint::new().prefix_key(b"a").equal_to("x", 1i64);
        let ordered = base.clone().order_by("x", true).limit(5);
        assert_eq!(base.identify(), ordered.identify());
    }

    #[test]
    fn identity_depends_on_prefix_and_index() {
        let a = QueryFingerprint::new().prefix_key(b"a");
        let b = QueryFingerprint::new().prefix_key(b"b");
        assert_ne!(a.identify(), b.identify());
        assert_ne!(a.identify(), a.clone().suggest_index("idx").identify());
    }

    #[test]
    fn identity_preserves_condition_order() {
        let a = QueryFingerprint::new()
            .equal_to("x", 1i64)
            .and()
            .equal_to("y", 2i64);
        let b = QueryFingerprint::new()
            .equal_to("y", 2i64)
            .and()
            .equal_to("x", 1i64);
        assert_ne!(a.identify(), b.identify());
    }

    #[test]
    fn invalid_query_has_empty_identity_and_cannot_serialize() {
        let query = QueryFingerprint::new().equal_to("x", 1i64).and();
        assert!(!query.is_valid());
        assert!(query.identify().is_empty());
        let mut writer = ParcelWriter::with_length(query.parcel_len());
        assert!(matches!(
            query.write_to(&mut writer),
            Err(ProtocolError::InvalidArgs(_))
        ));
    }

    #[test]
    fn validation_rules() {
        assert!(QueryFingerprint::new().is_valid());
        assert!(QueryFingerprint::new().limit(3).is_valid());
        assert!(QueryFingerprint::new()
            .begin_group()
            .equal_to("a", 1i64)
            .or()
            .is_null("b")
            .end_group()
            .and()
            .in_values("c", vec![Value::Integer(1), Value::Integer(2)])
            .is_valid());
        assert!(!QueryFingerprint::new().begin_group().equal_to("a", 1i64).is_valid());
        assert!(!QueryFingerprint::new().and().equal_to("a", 1i64).is_valid());
        assert!(!QueryFingerprint::new().limit(1).equal_to("a", 1i64).is_valid());
        assert!(!QueryFingerprint::new().in_values("a", vec![]).is_valid());
        assert!(!QueryFingerprint::new().in_keys([b"".to_vec()]).is_valid());
    }

    #[test]
    fn version_follows_table_and_keys() {
        assert_eq!(QueryFingerprint::new().version(), QUERY_SYNC_OBJECT_VERSION_0);
        assert_eq!(
            QueryFingerprint::new().table("t").version(),
            QUERY_SYNC_OBJECT_VERSION_1
        );
        assert_eq!(
            QueryFingerprint::new().in_keys([b"k"]).version(),
            QUERY_SYNC_OBJECT_VERSION_1
        );
        assert_eq!(QueryFingerprint::new().table("").version(), QUERY_SYNC_OBJECT_VERSION_0);
    }

    #[test]
    fn roundtrip_both_versions() {
        let v0 = QueryFingerprint::new()
            .prefix_key(b"user/")
            .suggest_index("by_age")
            .greater_than("age", 18i64)
            .and()
            .not_like("name", "x%")
            .order_by("age", false)
            .limit(20);
        assert_eq!(roundtrip(&v0), v0);

        let v1 = QueryFingerprint::new()
            .table("contacts")
            .in_keys([b"k1".to_vec(), b"k2".to_vec()])
            .equal_to("score", 1.5f64);
        assert_eq!(roundtrip(&v1), v1);
        assert_eq!(roundtrip(&v1).identify(), v1.identify());
    }

    #[test]
    fn rejects_bad_magic_and_newer_version() {
        let query = QueryFingerprint::new();
        let mut writer = ParcelWriter::with_length(query.parcel_len());
        query.write_to(&mut writer).unwrap();
        let mut bytes = writer.finish().unwrap();

        let mut bad_magic = bytes.clone();
        bad_magic[0] ^= 0xff;
        assert!(matches!(
            QueryFingerprint::read_from(&mut ParcelReader::new(&bad_magic)),
            Err(ProtocolError::ParseFail(_))
        ));

        bytes[4..8].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            QueryFingerprint::read_from(&mut ParcelReader::new(&bytes)),
            Err(ProtocolError::VersionNotSupported { version: 7, .. })
        ));
    }

    #[test]
    fn matches_key_checks_prefix_and_keys() {
        let query = QueryFingerprint::new().prefix_key(b"a");
        assert!(query.matches_key(b"a1"));
        assert!(!query.matches_key(b"b1"));

        let keyed = QueryFingerprint::new().in_keys([b"a1"]);
        assert!(keyed.matches_key(b"a1"));
        assert!(!keyed.matches_key(b"a2"));
    }
}
