//! Replay of allocation traces against a [`Heap`].
//!
//! A trace is a text file in the classic allocator-lab format. It starts with four
//! integers (suggested heap size, number of ids, number of operations and a weight)
//! followed by one operation per line:
//!
//! ```text
//! a <id> <bytes>    allocate <bytes> and remember the payload as <id>
//! r <id> <bytes>    resize the payload remembered as <id>
//! f <id>            free the payload remembered as <id>
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.
//!
//! While replaying, every payload is filled with a pattern derived from its id and the
//! pattern is verified whenever the payload is freed or resized, so any overlap between
//! blocks or any clobbered payload is caught at the operation that revealed it.

use core::fmt;
use core::str::FromStr;

use tracing::{debug, info, instrument, trace, Level};

use crate::allocators::Heap;
use crate::error::HeapCheckError;
use crate::growers::Grower;
use crate::tag::ALIGNMENT;

/// A single trace operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Alloc { id: usize, size: usize },
    Resize { id: usize, size: usize },
    Free { id: usize },
}

impl Op {
    pub fn id(&self) -> usize {
        match *self {
            Op::Alloc { id, .. } | Op::Resize { id, .. } | Op::Free { id } => id,
        }
    }
}

/// A parsed allocation trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trace {
    /// Heap size the trace author expected to need, informational only.
    pub suggested_heap_size: usize,
    /// Ids used by the operations are below this bound.
    pub num_ids: usize,
    pub weight: u32,
    ops: Vec<Op>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Run [`Heap::check`] after every operation instead of only at the end.
    pub check_each_op: bool,
}

/// Outcome of a successful replay.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct ReplayStats {
    pub ops: usize,
    /// Largest sum of requested payload bytes live at the same time.
    pub peak_payload: usize,
    /// Region length after the last operation.
    pub region_len: usize,
    /// `peak_payload / region_len`, the fraction of the region the trace really needed.
    pub utilization: f64,
}

/// Everything that can go wrong while parsing or replaying a trace.
///
/// `op` fields are 0-based operation indices, `line` fields are 1-based line numbers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceError {
    Parse { line: usize, reason: String },
    /// A free or resize named an id that is not live.
    UnknownId { op: usize, id: usize },
    /// An allocation named an id that is still live.
    IdInUse { op: usize, id: usize },
    OutOfMemory { op: usize, size: usize },
    Misaligned { op: usize, id: usize },
    /// A payload lies (partly) outside the heap's region.
    OutOfRegion { op: usize, id: usize },
    Overlap { op: usize, id: usize, other: usize },
    /// A payload no longer holds what was written to it.
    Corrupted { op: usize, id: usize },
    Inconsistent { op: usize, error: HeapCheckError },
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::Parse { line, reason } => write!(f, "line {line}: {reason}"),
            TraceError::UnknownId { op, id } => write!(f, "op {op}: id {id} is not live"),
            TraceError::IdInUse { op, id } => write!(f, "op {op}: id {id} is already live"),
            TraceError::OutOfMemory { op, size } => {
                write!(f, "op {op}: allocation of {size} bytes failed")
            }
            TraceError::Misaligned { op, id } => write!(f, "op {op}: payload of id {id} is misaligned"),
            TraceError::OutOfRegion { op, id } => {
                write!(f, "op {op}: payload of id {id} lies outside the heap")
            }
            TraceError::Overlap { op, id, other } => {
                write!(f, "op {op}: payload of id {id} overlaps id {other}")
            }
            TraceError::Corrupted { op, id } => write!(f, "op {op}: payload of id {id} was clobbered"),
            TraceError::Inconsistent { op, error } => write!(f, "op {op}: heap is inconsistent, {error}"),
        }
    }
}

impl std::error::Error for TraceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TraceError::Inconsistent { error, .. } => Some(error),
            _ => None,
        }
    }
}

fn parse_error(line: usize, reason: impl Into<String>) -> TraceError {
    TraceError::Parse {
        line,
        reason: reason.into(),
    }
}

fn parse_num<T: FromStr>(token: Option<&str>, line: usize, what: &str) -> Result<T, TraceError> {
    let token = token.ok_or_else(|| parse_error(line, format!("missing {what}")))?;
    token
        .parse()
        .map_err(|_| parse_error(line, format!("bad {what} {token:?}")))
}

impl Trace {
    /// Parses a trace from its text form.
    pub fn parse(input: &str) -> Result<Trace, TraceError> {
        let mut header: Vec<usize> = Vec::with_capacity(4);
        let mut ops = vec![];
        let mut last_line = 0;

        for (index, raw) in input.lines().enumerate() {
            let line = index + 1;
            last_line = line;
            let text = raw.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }

            let mut tokens = text.split_whitespace();
            if header.len() < 4 {
                for token in tokens {
                    if header.len() == 4 {
                        return Err(parse_error(line, "operation on a header line"));
                    }
                    header.push(parse_num(Some(token), line, "header value")?);
                }
                continue;
            }

            let num_ids = header[1];
            let kind = tokens.next().unwrap_or_default();
            let id: usize = parse_num(tokens.next(), line, "id")?;
            if id >= num_ids {
                return Err(parse_error(line, format!("id {id} is not below {num_ids}")));
            }
            let op = match kind {
                "a" => Op::Alloc {
                    id,
                    size: parse_num(tokens.next(), line, "size")?,
                },
                "r" => Op::Resize {
                    id,
                    size: parse_num(tokens.next(), line, "size")?,
                },
                "f" => Op::Free { id },
                other => return Err(parse_error(line, format!("unknown operation {other:?}"))),
            };
            if tokens.next().is_some() {
                return Err(parse_error(line, "trailing tokens"));
            }
            ops.push(op);
        }

        let [suggested_heap_size, num_ids, num_ops, weight] = header[..] else {
            return Err(parse_error(last_line, "truncated header"));
        };
        if ops.len() != num_ops {
            return Err(parse_error(
                last_line,
                format!("header announces {num_ops} operations, found {}", ops.len()),
            ));
        }
        let weight = u32::try_from(weight).map_err(|_| parse_error(last_line, "weight out of range"))?;

        Ok(Trace {
            suggested_heap_size,
            num_ids,
            weight,
            ops,
        })
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Runs every operation of the trace against `heap`, verifying payloads as it goes.
    ///
    /// Blocks still live at the end of the trace are left allocated.
    #[instrument(level = "info", skip_all, fields(ops = self.ops.len()), err(Debug, level = Level::ERROR))]
    pub fn replay<G: Grower>(&self, heap: &mut Heap<G>, options: ReplayOptions) -> Result<ReplayStats, TraceError> {
        // Sized by the ids in use, the header's id count is only an upper bound.
        let ids = self.ops.iter().map(|op| op.id() + 1).max().unwrap_or(0);
        let mut live: Vec<Option<Payload>> = vec![None; ids];
        let mut payload_bytes = 0;
        let mut stats = ReplayStats::default();

        for (op, &operation) in self.ops.iter().enumerate() {
            trace!(op, ?operation, "Replaying.");
            match operation {
                Op::Alloc { id, size } => {
                    if live[id].is_some() {
                        return Err(TraceError::IdInUse { op, id });
                    }
                    let ptr = heap.allocate(size);
                    if ptr.is_null() && size != 0 {
                        return Err(TraceError::OutOfMemory { op, size });
                    }
                    let payload = Payload { ptr, size };
                    verify_placement(heap, &live, op, id, payload)?;
                    payload.fill(id);
                    live[id] = Some(payload);
                    payload_bytes += size;
                }
                Op::Resize { id, size } => {
                    let old = live[id].ok_or(TraceError::UnknownId { op, id })?;
                    if !old.holds(id) {
                        return Err(TraceError::Corrupted { op, id });
                    }
                    let ptr = unsafe { heap.resize(old.ptr, size) };
                    if ptr.is_null() && size != 0 {
                        return Err(TraceError::OutOfMemory { op, size });
                    }
                    let new = Payload { ptr, size };
                    // The kept prefix must have travelled with the block.
                    let kept = Payload {
                        ptr,
                        size: old.size.min(size),
                    };
                    if !kept.holds(id) {
                        return Err(TraceError::Corrupted { op, id });
                    }
                    live[id] = None;
                    verify_placement(heap, &live, op, id, new)?;
                    new.fill(id);
                    live[id] = Some(new);
                    payload_bytes = payload_bytes - old.size + size;
                }
                Op::Free { id } => {
                    let old = live[id].take().ok_or(TraceError::UnknownId { op, id })?;
                    if !old.holds(id) {
                        return Err(TraceError::Corrupted { op, id });
                    }
                    unsafe { heap.free(old.ptr) };
                    payload_bytes -= old.size;
                }
            }

            stats.peak_payload = stats.peak_payload.max(payload_bytes);
            if options.check_each_op {
                heap.check().map_err(|error| TraceError::Inconsistent { op, error })?;
            }
        }

        let last_op = self.ops.len().saturating_sub(1);
        heap.check()
            .map_err(|error| TraceError::Inconsistent { op: last_op, error })?;

        stats.ops = self.ops.len();
        stats.region_len = heap.region_len();
        if stats.region_len != 0 {
            stats.utilization = stats.peak_payload as f64 / stats.region_len as f64;
        }
        info!(
            peak_payload = stats.peak_payload,
            region_len = stats.region_len,
            utilization = stats.utilization,
            "Trace replayed."
        );
        Ok(stats)
    }
}

impl FromStr for Trace {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Trace::parse(s)
    }
}

/// A live payload as handed out by the heap, null for zero-sized requests.
#[derive(Copy, Clone, Debug)]
struct Payload {
    ptr: *mut u8,
    size: usize,
}

#[inline]
fn pattern(id: usize, index: usize) -> u8 {
    (id.wrapping_mul(151) ^ index.wrapping_mul(7)) as u8
}

impl Payload {
    fn range(&self) -> (usize, usize) {
        let start = self.ptr as usize;
        (start, start + self.size)
    }

    fn fill(&self, id: usize) {
        for i in 0..self.size {
            unsafe { self.ptr.add(i).write(pattern(id, i)) };
        }
    }

    fn holds(&self, id: usize) -> bool {
        (0..self.size).all(|i| unsafe { self.ptr.add(i).read() } == pattern(id, i))
    }
}

fn verify_placement<G: Grower>(
    heap: &Heap<G>,
    live: &[Option<Payload>],
    op: usize,
    id: usize,
    payload: Payload,
) -> Result<(), TraceError> {
    if payload.size == 0 {
        return Ok(());
    }
    if payload.ptr as usize % ALIGNMENT as usize != 0 {
        return Err(TraceError::Misaligned { op, id });
    }

    let (start, end) = payload.range();
    let base = heap.grower().base().map_or(0, |base| base.as_ptr() as usize);
    let region_end = heap.grower().end().map_or(0, |end| end.as_ptr() as usize);
    if start < base || end > region_end {
        return Err(TraceError::OutOfRegion { op, id });
    }

    for (other, entry) in live.iter().enumerate() {
        let Some(entry) = entry else {
            continue;
        };
        let (other_start, other_end) = entry.range();
        if entry.size != 0 && start < other_end && other_start < end {
            return Err(TraceError::Overlap { op, id, other });
        }
    }
    debug!(op, id, start = start - base, "Payload placed.");
    Ok(())
}
