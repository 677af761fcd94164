//! Remote query packets.
//!
//! A peer can ask another peer to run a read-only statement and stream the
//! result rows back. These packets have their own version line, independent
//! of the software version used by data and control packets.

use super::{
    check_version, conditions_len, read_conditions, validate_conditions, write_conditions,
    ConditionMap, SyncPacket,
};
use crate::error::{status, ProtocolError, ProtocolResult};
use replidb_codec::{len, ParcelReader, ParcelWriter, Value};

/// First remote query layout.
pub const REMOTE_EXECUTOR_PACKET_VERSION_V1: u32 = 1;
/// Adds extra conditions to the request.
pub const REMOTE_EXECUTOR_PACKET_VERSION_V2: u32 = 2;
/// Newest remote query layout.
pub const REMOTE_EXECUTOR_PACKET_VERSION_CURRENT: u32 = REMOTE_EXECUTOR_PACKET_VERSION_V2;

/// The sender waits for an ack.
pub const REMOTE_REQUEST_FLAG_NEED_RESPONSE: u32 = 0x1;
/// Final ack of a result stream.
pub const REMOTE_ACK_FLAG_LAST: u32 = 0x1;
/// A security option section follows the rows.
pub const REMOTE_ACK_FLAG_SECURITY_OPTION: u32 = 0x2;

const MAX_SQL_LEN: usize = 1024 * 1024;
const MAX_BIND_ARGS: usize = 1000;
const MAX_COLUMNS: usize = 1000;
const MAX_COLUMN_NAME_LEN: usize = 256;

/// Kind of statement a peer may execute remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatementOpcode {
    /// Read-only query.
    Query = 1,
}

impl StatementOpcode {
    fn from_i32(value: i32) -> ProtocolResult<Self> {
        match value {
            1 => Ok(StatementOpcode::Query),
            other => Err(ProtocolError::invalid_args(format!(
                "invalid statement opcode {other}"
            ))),
        }
    }
}

/// A statement with its bind arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    /// Statement layout version.
    pub version: i32,
    /// Statement kind.
    pub opcode: StatementOpcode,
    /// SQL text.
    pub sql: String,
    /// Positional bind arguments.
    pub bind_args: Vec<String>,
}

impl PreparedStatement {
    /// Creates a query statement.
    pub fn query(sql: impl Into<String>, bind_args: Vec<String>) -> Self {
        Self {
            version: 1,
            opcode: StatementOpcode::Query,
            sql: sql.into(),
            bind_args,
        }
    }

    fn parcel_len(&self) -> usize {
        len::U32 * 2
            + len::string(&self.sql)
            + len::U32
            + self.bind_args.iter().map(|a| len::string(a)).sum::<usize>()
    }

    fn write_to(&self, writer: &mut ParcelWriter) -> ProtocolResult<()> {
        if self.sql.len() > MAX_SQL_LEN || self.bind_args.len() > MAX_BIND_ARGS {
            return Err(ProtocolError::invalid_args("statement too large"));
        }
        writer.write_i32(self.version);
        writer.write_i32(self.opcode as i32);
        writer.write_string(&self.sql);
        writer.write_i32(self.bind_args.len() as i32);
        for arg in &self.bind_args {
            writer.write_string(arg);
        }
        Ok(())
    }

    fn read_from(reader: &mut ParcelReader<'_>) -> ProtocolResult<Self> {
        let version = reader.read_i32();
        let opcode = reader.read_i32();
        let sql = reader.read_string("sql", MAX_SQL_LEN);
        let count = reader.read_i32();
        reader.status()?;
        let opcode = StatementOpcode::from_i32(opcode)?;
        let count = usize::try_from(count)
            .ok()
            .filter(|c| *c <= MAX_BIND_ARGS)
            .ok_or_else(|| ProtocolError::invalid_args(format!("bad bind arg count {count}")))?;
        let mut bind_args = Vec::with_capacity(count);
        for _ in 0..count {
            bind_args.push(reader.read_string("bind arg", MAX_SQL_LEN));
        }
        reader.status()?;
        Ok(Self {
            version,
            opcode,
            sql,
            bind_args,
        })
    }
}

/// Request to run a statement on a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteExecutorRequestPacket {
    /// Remote query layout version.
    pub version: u32,
    /// `REMOTE_REQUEST_FLAG_*` bits.
    pub flag: u32,
    /// Statement to run.
    pub statement: PreparedStatement,
    /// Extra conditions. Sent from version 2.
    pub conditions: ConditionMap,
}

impl RemoteExecutorRequestPacket {
    /// Creates a current-version request that expects a response.
    pub fn new(statement: PreparedStatement) -> Self {
        Self {
            version: REMOTE_EXECUTOR_PACKET_VERSION_CURRENT,
            flag: REMOTE_REQUEST_FLAG_NEED_RESPONSE,
            statement,
            conditions: ConditionMap::new(),
        }
    }

    /// Returns true if the sender waits for an ack.
    pub fn needs_response(&self) -> bool {
        self.flag & REMOTE_REQUEST_FLAG_NEED_RESPONSE != 0
    }
}

impl SyncPacket for RemoteExecutorRequestPacket {
    fn length(&self) -> usize {
        let mut total = len::align8(len::U32 * 2 + self.statement.parcel_len());
        if self.version >= REMOTE_EXECUTOR_PACKET_VERSION_V2 {
            total = len::align8(total + conditions_len(&self.conditions));
        }
        total
    }

    fn serialize(&self, writer: &mut ParcelWriter) -> ProtocolResult<()> {
        writer.write_u32(self.version);
        writer.write_u32(self.flag);
        self.statement.write_to(writer)?;
        writer.align8();
        if self.version >= REMOTE_EXECUTOR_PACKET_VERSION_V2 {
            validate_conditions(&self.conditions)?;
            write_conditions(writer, &self.conditions);
            writer.align8();
        } else if !self.conditions.is_empty() {
            return Err(ProtocolError::invalid_args(
                "extra conditions need remote query version 2",
            ));
        }
        writer.status()?;
        Ok(())
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> ProtocolResult<Self> {
        let version = reader.read_u32();
        let flag = reader.read_u32();
        reader.status()?;
        check_version(version, REMOTE_EXECUTOR_PACKET_VERSION_CURRENT)?;
        let statement = PreparedStatement::read_from(reader)?;
        reader.align8();
        let mut conditions = ConditionMap::new();
        if version >= REMOTE_EXECUTOR_PACKET_VERSION_V2 {
            conditions = read_conditions(reader)?;
            reader.align8();
        }
        reader.status()?;
        Ok(Self {
            version,
            flag,
            statement,
            conditions,
        })
    }
}

/// Tabular result of a remote query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowDataSet {
    /// Column names.
    pub columns: Vec<String>,
    /// Rows; every row has one cell per column.
    pub rows: Vec<Vec<Value>>,
}

impl RowDataSet {
    fn parcel_len(&self) -> usize {
        len::U32
            + self.columns.iter().map(|c| len::string(c)).sum::<usize>()
            + len::U32
            + self
                .rows
                .iter()
                .flat_map(|row| row.iter())
                .map(Value::parcel_len)
                .sum::<usize>()
    }

    fn write_to(&self, writer: &mut ParcelWriter) -> ProtocolResult<()> {
        if self.rows.iter().any(|row| row.len() != self.columns.len()) {
            return Err(ProtocolError::invalid_args("row width differs from column count"));
        }
        writer.write_u32(self.columns.len() as u32);
        for column in &self.columns {
            writer.write_string(column);
        }
        writer.write_u32(self.rows.len() as u32);
        for cell in self.rows.iter().flat_map(|row| row.iter()) {
            cell.write_to(writer);
        }
        Ok(())
    }

    fn read_from(reader: &mut ParcelReader<'_>) -> ProtocolResult<Self> {
        let column_count = reader.read_u32() as usize;
        reader.status()?;
        if column_count > MAX_COLUMNS {
            return Err(ProtocolError::LengthError(format!(
                "{column_count} columns exceed limit {MAX_COLUMNS}"
            )));
        }
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            columns.push(reader.read_string("column name", MAX_COLUMN_NAME_LEN));
        }
        let row_count = reader.read_u32() as usize;
        reader.status()?;
        // Every cell carries at least its four byte tag.
        let min_bytes = row_count.saturating_mul(column_count).saturating_mul(len::U32);
        if min_bytes > reader.remaining() || (column_count == 0 && row_count != 0) {
            return Err(ProtocolError::LengthError(format!(
                "{row_count} rows do not fit the remaining input"
            )));
        }
        let mut rows = Vec::with_capacity(row_count);
        for _ in 0..row_count {
            let row: Vec<Value> = (0..column_count).map(|_| Value::read_from(reader)).collect();
            rows.push(row);
        }
        reader.status()?;
        Ok(Self { columns, rows })
    }
}

/// Security classification of the data a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityOption {
    /// Security label.
    pub label: i32,
    /// Security flag.
    pub flag: i32,
}

/// Result of a remote query.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteExecutorAckPacket {
    /// Remote query layout version.
    pub version: u32,
    /// `REMOTE_ACK_FLAG_*` bits.
    pub flag: u32,
    /// Status code of the execution.
    pub ack_code: i32,
    /// Result rows.
    pub rows: RowDataSet,
    security: Option<SecurityOption>,
}

impl RemoteExecutorAckPacket {
    /// Creates a final current-version ack.
    pub fn new(ack_code: i32, rows: RowDataSet) -> Self {
        Self {
            version: REMOTE_EXECUTOR_PACKET_VERSION_CURRENT,
            flag: REMOTE_ACK_FLAG_LAST,
            ack_code,
            rows,
            security: None,
        }
    }

    /// Creates an error ack without rows.
    pub fn error(ack_code: i32) -> Self {
        Self::new(ack_code, RowDataSet::default())
    }

    /// Attaches a security classification.
    pub fn with_security_option(mut self, option: SecurityOption) -> Self {
        self.security = Some(option);
        self.flag |= REMOTE_ACK_FLAG_SECURITY_OPTION;
        self
    }

    /// Security classification, if attached.
    pub fn security_option(&self) -> Option<SecurityOption> {
        self.security
    }

    /// Returns true if this is the final ack of the stream.
    pub fn is_last(&self) -> bool {
        self.flag & REMOTE_ACK_FLAG_LAST != 0
    }

    /// Returns true if the execution succeeded.
    pub fn is_ok(&self) -> bool {
        self.ack_code == status::OK
    }

    fn has_security(&self) -> bool {
        self.flag & REMOTE_ACK_FLAG_SECURITY_OPTION != 0
    }
}

impl SyncPacket for RemoteExecutorAckPacket {
    fn length(&self) -> usize {
        let mut total = len::align8(len::U32 * 3 + self.rows.parcel_len());
        if self.has_security() {
            total += len::align8(len::U32 * 2);
        }
        total
    }

    fn serialize(&self, writer: &mut ParcelWriter) -> ProtocolResult<()> {
        writer.write_u32(self.version);
        writer.write_u32(self.flag);
        writer.write_i32(self.ack_code);
        self.rows.write_to(writer)?;
        writer.align8();
        if self.has_security() {
            let option = self
                .security
                .ok_or_else(|| ProtocolError::invalid_args("security flag without option"))?;
            writer.write_i32(option.label);
            writer.write_i32(option.flag);
            writer.align8();
        }
        writer.status()?;
        Ok(())
    }

    fn deserialize(reader: &mut ParcelReader<'_>) -> ProtocolResult<Self> {
        let version = reader.read_u32();
        let flag = reader.read_u32();
        let ack_code = reader.read_i32();
        reader.status()?;
        check_version(version, REMOTE_EXECUTOR_PACKET_VERSION_CURRENT)?;
        let rows = RowDataSet::read_from(reader)?;
        reader.align8();
        let mut security = None;
        if flag & REMOTE_ACK_FLAG_SECURITY_OPTION != 0 {
            let label = reader.read_i32();
            let option_flag = reader.read_i32();
            reader.align8();
            security = Some(SecurityOption {
                label,
                flag: option_flag,
            });
        }
        reader.status()?;
        Ok(Self {
            version,
            flag,
            ack_code,
            rows,
            security,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statement() -> PreparedStatement {
        PreparedStatement::query("SELECT * FROM t WHERE a = ?", vec!["1".into()])
    }

    #[test]
    fn request_roundtrip_both_versions() {
        let mut v2 = RemoteExecutorRequestPacket::new(statement());
        v2.conditions.insert("user".into(), "alice".into());
        let bytes = v2.to_bytes().unwrap();
        assert_eq!(bytes.len(), v2.length());
        assert_eq!(RemoteExecutorRequestPacket::from_bytes(&bytes).unwrap(), v2);

        let mut v1 = RemoteExecutorRequestPacket::new(statement());
        v1.version = REMOTE_EXECUTOR_PACKET_VERSION_V1;
        let bytes = v1.to_bytes().unwrap();
        assert_eq!(bytes.len(), v1.length());
        assert!(v1.length() < v2.length());
        assert_eq!(RemoteExecutorRequestPacket::from_bytes(&bytes).unwrap(), v1);
    }

    #[test]
    fn v1_request_cannot_carry_conditions() {
        let mut v1 = RemoteExecutorRequestPacket::new(statement());
        v1.version = REMOTE_EXECUTOR_PACKET_VERSION_V1;
        v1.conditions.insert("k".into(), "v".into());
        assert!(v1.to_bytes().is_err());
    }

    #[test]
    fn ack_roundtrip_with_security() {
        let rows = RowDataSet {
            columns: vec!["id".into(), "name".into(), "score".into()],
            rows: vec![
                vec![Value::Integer(1), Value::Text("a".into()), Value::Real(0.5)],
                vec![Value::Integer(2), Value::Null, Value::Bytes(vec![1, 2])],
            ],
        };
        let ack = RemoteExecutorAckPacket::new(status::OK, rows).with_security_option(
            SecurityOption { label: 2, flag: 1 },
        );
        let bytes = ack.to_bytes().unwrap();
        assert_eq!(bytes.len(), ack.length());
        let decoded = RemoteExecutorAckPacket::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, ack);
        assert_eq!(decoded.security_option(), Some(SecurityOption { label: 2, flag: 1 }));
        assert!(decoded.is_last());
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let rows = RowDataSet {
            columns: vec!["a".into()],
            rows: vec![vec![]],
        };
        assert!(RemoteExecutorAckPacket::new(status::OK, rows).to_bytes().is_err());
    }

    #[test]
    fn row_count_beyond_input_is_rejected() {
        let ack = RemoteExecutorAckPacket::new(
            status::OK,
            RowDataSet {
                columns: vec!["a".into()],
                rows: vec![vec![Value::Integer(1)]],
            },
        );
        let mut bytes = ack.to_bytes().unwrap();
        // version, flag, code, column count, column name, then the row count
        let offset = len::U32 * 4 + len::string("a");
        bytes[offset..offset + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            RemoteExecutorAckPacket::from_bytes(&bytes),
            Err(ProtocolError::LengthError(_))
        ));
    }
}
