#![forbid(unsafe_code)]

//! SQLite persistence for memory-access history slices.
//!
//! [`SqliteHistoryWriter`] accepts a trace-ordered stream of memory
//! accesses, aggregates them through two slice builders (one per operation
//! kind) and flushes completed slices into a fixed relational schema tuned
//! for half-axis range queries ("first N accesses from transition T,
//! forward or backward, within an address range").

use std::collections::HashMap;
use std::mem;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use memhist_core::{AccessRef, Chunk, HistoryError, MemoryAccess, Operation, Slice, SliceBuilder};
use rusqlite::{params, Connection, Transaction};
use time::OffsetDateTime;

/// On-disk format version of the history database.
pub const FORMAT_VERSION: &str = "1.0.0";
/// Version of this writer, recorded in the metadata sidecar.
pub const WRITER_VERSION: &str = "1.1.0";
/// Resource type tag stamped into the metadata sidecar.
pub const RESOURCE_TYPE: &str = "memhist";

const SCHEMA: &str = "\
create table slices(
  transition_first int8 not null,
  transition_last  int8 not null);
create table chunks(
  slice_id   int8 not null,
  phy_first  int8 not null,
  phy_last   int8 not null,
  operation  int  not null);
create table accesses(
  chunk_id   int8 not null,
  transition int8 not null,
  linear     int8,
  phy_first  int8 not null,
  size       int  not null,
  operation  int  not null);
create index idx_slices_1   on slices(transition_last);
create index idx_chunks_1   on chunks(operation, slice_id, phy_last);
create index idx_accesses_1 on accesses(chunk_id, transition);
create index idx_accesses_2 on accesses(transition);
";

const PRAGMAS: &str = "\
pragma synchronous=off;
pragma count_changes=off;
pragma journal_mode=memory;
pragma temp_store=memory;
";

const METADATA_SCHEMA: &str = "\
create table if not exists metadata(
  resource_type  text not null,
  format_version text not null,
  writer_version text not null,
  tool_name      text not null,
  tool_version   text not null,
  tool_info      text not null,
  created_at     text not null);
";

/// Capacity limits applied to every freshly constructed slice builder.
///
/// The defaults are empirical: the overlap cap keeps chunk lookups fast,
/// the access-count cap bounds the resident set to roughly 3 GB.
#[derive(Debug, Clone, Copy)]
struct CapacityLimits {
    chunk_size_overlap_limit: u64,
    chunk_size_touch_limit: u64,
    access_count_limit: u64,
    transition_limit: Option<u64>,
}

impl Default for CapacityLimits {
    fn default() -> Self {
        Self {
            chunk_size_overlap_limit: 100_000,
            chunk_size_touch_limit: 1_000,
            access_count_limit: 10_000_000,
            transition_limit: None,
        }
    }
}

/// Arrival-order record of one accepted access, carrying what the slice
/// nodes do not store: the virtual address and the operation kind.
#[derive(Debug, Clone, Copy)]
struct LoggedAccess {
    operation: Operation,
    node: AccessRef,
    has_virtual_address: bool,
    virtual_address: u64,
}

/// Streaming writer for a memory-access history database.
///
/// Single-threaded and synchronous; accesses must be pushed in trace order
/// (non-decreasing transition). Slices are flushed when a capacity limit
/// trips, on [`discard_after`](Self::discard_after), on
/// [`take`](Self::take) and on drop.
pub struct SqliteHistoryWriter {
    conn: Option<Connection>,
    read_builder: SliceBuilder,
    write_builder: SliceBuilder,
    access_log: Vec<LoggedAccess>,
    limits: CapacityLimits,
}

impl SqliteHistoryWriter {
    /// Create a history database at `path`, stamp its metadata and prepare
    /// the writer.
    ///
    /// # Errors
    /// Fails when the file cannot be opened or the schema cannot be
    /// created, notably when `path` already holds a history database.
    pub fn create(
        path: &Path,
        tool_name: &str,
        tool_version: &str,
        tool_info: &str,
    ) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open history database at {}", path.display()))?;
        Self::with_connection(conn, tool_name, tool_version, tool_info)
    }

    /// Writer backed by a non-persistent in-memory database.
    ///
    /// # Errors
    /// Fails when the in-memory store cannot be initialized.
    pub fn from_memory(tool_name: &str, tool_version: &str, tool_info: &str) -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory history database")?;
        Self::with_connection(conn, tool_name, tool_version, tool_info)
    }

    fn with_connection(
        conn: Connection,
        tool_name: &str,
        tool_version: &str,
        tool_info: &str,
    ) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to create history schema")?;
        conn.execute_batch(PRAGMAS)
            .context("failed to apply history pragmas")?;
        stamp_metadata(&conn, tool_name, tool_version, tool_info)?;

        let limits = CapacityLimits::default();
        Ok(Self {
            conn: Some(conn),
            read_builder: fresh_builder(limits),
            write_builder: fresh_builder(limits),
            access_log: Vec::new(),
            limits,
        })
    }

    #[cfg(test)]
    fn with_limits(mut self, limits: CapacityLimits) -> Self {
        self.limits = limits;
        self.read_builder = fresh_builder(limits);
        self.write_builder = fresh_builder(limits);
        self
    }

    /// Record one access.
    ///
    /// # Errors
    /// `Unsupported` for Execute accesses, `InvalidArgument` for malformed
    /// ones (zero size, wrapping address range, backward transition), and
    /// store errors when a slice flush fails mid-push.
    pub fn push(&mut self, access: &MemoryAccess) -> Result<()> {
        let inserted = self
            .builder_mut(access.operation)?
            .insert(access.transition, access.physical_address, access.size)?;
        let node = match inserted {
            Some(node) => node,
            None => {
                // The slice is full: persist it and retry against the fresh
                // builder pair.
                self.flush()?;
                self.builder_mut(access.operation)?
                    .insert(access.transition, access.physical_address, access.size)?
                    .ok_or_else(|| {
                        HistoryError::Invariant(
                            "insertion into an empty slice must succeed".to_string(),
                        )
                    })?
            }
        };
        self.access_log.push(LoggedAccess {
            operation: access.operation,
            node,
            has_virtual_address: access.has_virtual_address,
            virtual_address: access.virtual_address,
        });
        Ok(())
    }

    /// Remove every persisted access with a transition `>= transition_count`.
    ///
    /// Meant to trim a recording whose final transition is incomplete; the
    /// open slices are flushed first, whatever their fill level, and
    /// pushing afterwards is outside the caller contract. Slice and chunk
    /// rows are not shrunk, so a chunk may be left holding no accesses;
    /// readers observe that as an empty result set for the chunk.
    ///
    /// # Errors
    /// Store errors from the flush or the deletion.
    pub fn discard_after(&mut self, transition_count: u64) -> Result<()> {
        self.flush()?;
        let transition = encode_u64(transition_count);
        self.connection()?
            .execute(
                "delete from accesses
                  where chunk_id >= (select min(rowid) from chunks
                                      where slice_id = (select rowid from slices
                                                        where transition_last >= ?1
                                                        limit 1)
                                      limit 1)
                    and transition >= ?1",
                params![transition],
            )
            .context("failed to discard trailing accesses")?;
        Ok(())
    }

    /// Flush pending slices and hand the database over to the caller.
    ///
    /// # Errors
    /// Store errors from the final flush.
    pub fn take(mut self) -> Result<Connection> {
        self.flush()?;
        self.conn
            .take()
            .ok_or_else(|| anyhow!("history database was already taken"))
    }

    fn builder_mut(&mut self, operation: Operation) -> Result<&mut SliceBuilder> {
        match operation {
            Operation::Read => Ok(&mut self.read_builder),
            Operation::Write => Ok(&mut self.write_builder),
            Operation::Execute => Err(HistoryError::Unsupported(
                "execute accesses are not recorded".to_string(),
            )
            .into()),
        }
    }

    fn connection(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| anyhow!("history database was already taken"))
    }

    /// Persist the current builder pair as one slice. A flush with no
    /// logged access is a no-op. On error the writer must be discarded.
    fn flush(&mut self) -> Result<()> {
        if self.access_log.is_empty() {
            return Ok(());
        }

        let limits = self.limits;
        let read_slice = mem::replace(&mut self.read_builder, fresh_builder(limits)).build()?;
        let write_slice = mem::replace(&mut self.write_builder, fresh_builder(limits)).build()?;
        let access_log = mem::take(&mut self.access_log);

        let conn = self.connection()?;
        let tx = conn
            .transaction()
            .context("failed to begin slice transaction")?;
        let slice_id = insert_slice(&tx, &read_slice, &write_slice)?;
        let chunk_ids = insert_chunks(&tx, &read_slice, &write_slice, slice_id)?;
        insert_accesses(&tx, &read_slice, &write_slice, &access_log, &chunk_ids)?;
        tx.commit().context("failed to commit slice transaction")?;

        // The slices drop with this frame, invalidating the logged handles
        // along with them.
        Ok(())
    }
}

impl Drop for SqliteHistoryWriter {
    fn drop(&mut self) {
        // Errors cannot surface from a destructor; an interrupted final
        // flush rolls back with its transaction. Callers that need the
        // error use `take`.
        if self.conn.is_some() {
            let _ = self.flush();
        }
    }
}

fn fresh_builder(limits: CapacityLimits) -> SliceBuilder {
    let builder = SliceBuilder::new()
        .chunk_size_overlap_limit(limits.chunk_size_overlap_limit)
        .chunk_size_touch_limit(limits.chunk_size_touch_limit)
        .access_count_limit(limits.access_count_limit);
    match limits.transition_limit {
        Some(limit) => builder.transition_limit(limit),
        None => builder,
    }
}

fn stamp_metadata(
    conn: &Connection,
    tool_name: &str,
    tool_version: &str,
    tool_info: &str,
) -> Result<()> {
    conn.execute_batch(METADATA_SCHEMA)
        .context("failed to create metadata table")?;
    conn.execute(
        "insert into metadata values (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            RESOURCE_TYPE,
            FORMAT_VERSION,
            WRITER_VERSION,
            tool_name,
            tool_version,
            format!("{tool_info} - using memhist-writer {WRITER_VERSION}"),
            rfc3339(OffsetDateTime::now_utc())?,
        ],
    )
    .context("failed to stamp metadata")?;
    Ok(())
}

fn insert_slice(tx: &Transaction<'_>, read_slice: &Slice, write_slice: &Slice) -> Result<i64> {
    if read_slice.is_empty() && write_slice.is_empty() {
        return Err(HistoryError::Invariant(
            "refusing to persist an empty slice pair".to_string(),
        )
        .into());
    }

    let (transition_first, transition_last) = if read_slice.is_empty() {
        (write_slice.transition_first(), write_slice.transition_last())
    } else if write_slice.is_empty() {
        (read_slice.transition_first(), read_slice.transition_last())
    } else {
        (
            read_slice
                .transition_first()
                .min(write_slice.transition_first()),
            read_slice
                .transition_last()
                .max(write_slice.transition_last()),
        )
    };

    let mut stmt = tx
        .prepare_cached("insert into slices values (?1, ?2)")
        .context("failed to prepare slice insertion")?;
    stmt.execute(params![
        encode_u64(transition_first),
        encode_u64(transition_last)
    ])
    .context("failed to insert slice row")?;
    Ok(tx.last_insert_rowid())
}

type ChunkRowIds = HashMap<(Operation, AccessRef), i64>;

fn insert_chunks(
    tx: &Transaction<'_>,
    read_slice: &Slice,
    write_slice: &Slice,
    slice_id: i64,
) -> Result<ChunkRowIds> {
    let mut chunk_list: Vec<(Operation, &Slice, &Chunk)> = read_slice
        .chunks()
        .map(|chunk| (Operation::Read, read_slice, chunk))
        .chain(
            write_slice
                .chunks()
                .map(|chunk| (Operation::Write, write_slice, chunk)),
        )
        .collect();
    // Descending address emission order; the (operation, slice_id, phy_last)
    // index recovers query order.
    chunk_list.sort_by(|a, b| b.2.address_first().cmp(&a.2.address_first()));

    let mut stmt = tx
        .prepare_cached("insert into chunks values (?1, ?2, ?3, ?4)")
        .context("failed to prepare chunk insertion")?;
    let mut chunk_ids = ChunkRowIds::new();
    for (operation, slice, chunk) in chunk_list {
        stmt.execute(params![
            slice_id,
            encode_u64(chunk.address_first()),
            encode_u64(chunk.address_last()),
            operation.as_byte(),
        ])
        .context("failed to insert chunk row")?;
        let chunk_id = tx.last_insert_rowid();
        for (handle, _) in slice.accesses_of(chunk) {
            chunk_ids.insert((operation, handle), chunk_id);
        }
    }
    Ok(chunk_ids)
}

fn insert_accesses(
    tx: &Transaction<'_>,
    read_slice: &Slice,
    write_slice: &Slice,
    access_log: &[LoggedAccess],
    chunk_ids: &ChunkRowIds,
) -> Result<()> {
    let mut stmt = tx
        .prepare_cached("insert into accesses values (?1, ?2, ?3, ?4, ?5, ?6)")
        .context("failed to prepare access insertion")?;
    for logged in access_log {
        let slice = match logged.operation {
            Operation::Read => read_slice,
            Operation::Write => write_slice,
            Operation::Execute => {
                return Err(HistoryError::Invariant(
                    "execute access found in the access log".to_string(),
                )
                .into())
            }
        };
        let node = slice.access(logged.node).ok_or_else(|| {
            HistoryError::Invariant("logged access handle is out of bounds".to_string())
        })?;
        let chunk_id = chunk_ids
            .get(&(logged.operation, logged.node))
            .ok_or_else(|| {
                HistoryError::Invariant(
                    "logged access is missing from the chunk mapping".to_string(),
                )
            })?;
        let linear = logged
            .has_virtual_address
            .then(|| encode_u64(logged.virtual_address));
        stmt.execute(params![
            chunk_id,
            encode_u64(node.transition),
            linear,
            encode_u64(node.address),
            node.size,
            logged.operation.as_byte(),
        ])
        .context("failed to insert access row")?;
    }
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

/// SQLite integers are signed 64-bit; wide addresses are stored as their
/// two's-complement bit pattern.
fn encode_u64(value: u64) -> i64 {
    i64::from_ne_bytes(value.to_ne_bytes())
}
