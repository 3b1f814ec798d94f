//! The runtime side: a bounded ring of fixed-size text records that
//! instrumented code writes one record into per trace call.
//!
//! The ring never blocks and never evicts. A slot stays occupied until a
//! consumer drains it, and acquiring a slot when every slot is occupied fails
//! with `Error::Capacity`. Through the process-wide [`track`] entry point
//! that failure terminates the process.

use crate::error::{Error, Result};
use log::{error, trace};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::fmt::{self, Write as _};
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of slots the process-wide sink is usually created with
pub const DEFAULT_CAPACITY: usize = 4096;

/// Size in bytes of each record buffer, including room for a terminator;
/// rendered records are truncated to `SLOT_SIZE - 1` bytes.
pub const SLOT_SIZE: usize = 256;

/// A runtime value passed to the trace entry point
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum TraceArg {
    /// Rendered by `%u`
    Int(u64),
    /// Rendered by `%p`
    Ptr(usize),
}

impl From<u64> for TraceArg {
    fn from(value: u64) -> Self {
        TraceArg::Int(value)
    }
}

impl From<u32> for TraceArg {
    fn from(value: u32) -> Self {
        TraceArg::Int(value.into())
    }
}

impl From<i32> for TraceArg {
    fn from(value: i32) -> Self {
        // same bits `%u` would see
        TraceArg::Int((value as u32).into())
    }
}

impl From<i64> for TraceArg {
    fn from(value: i64) -> Self {
        TraceArg::Int(value as u64)
    }
}

impl<T> From<*const T> for TraceArg {
    fn from(ptr: *const T) -> Self {
        TraceArg::Ptr(ptr as usize)
    }
}

impl<T> From<*mut T> for TraceArg {
    fn from(ptr: *mut T) -> Self {
        TraceArg::Ptr(ptr as usize)
    }
}

/// Exclusive right to render one record into one slot of the sink that
/// issued it. Not `Clone`: exactly one writer per slot.
#[derive(Debug)]
pub struct SlotHandle {
    sink: usize,
    index: usize,
}

impl SlotHandle {
    pub fn index(&self) -> usize {
        self.index
    }
}

struct Slot {
    buf: Box<[u8]>,
    len: usize,
}

impl Slot {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.buf[.. self.len]).into_owned()
    }
}

static NEXT_SINK_ID: AtomicUsize = AtomicUsize::new(0);

/// A bounded ring of fixed-size text records
pub struct TraceSink {
    /// Distinguishes this sink's `SlotHandle`s from any other sink's
    id: usize,
    slots: Vec<Slot>,
    /// Index of the oldest occupied slot
    oldest: usize,
    /// Number of occupied slots
    occupied: usize,
    /// Where rendered records are surfaced
    out: Box<dyn Write + Send>,
}

impl TraceSink {
    /// A sink with `capacity` slots of `SLOT_SIZE` bytes, surfacing records
    /// on stdout
    pub fn new(capacity: usize) -> Self {
        Self::with_output(capacity, SLOT_SIZE, io::stdout())
    }

    /// A sink with `capacity` slots of `slot_size` bytes, surfacing records
    /// on `out`
    pub fn with_output(capacity: usize, slot_size: usize, out: impl Write + Send + 'static) -> Self {
        let slot_size = slot_size.max(1);
        Self {
            id: NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed),
            slots: (0 .. capacity)
                .map(|_| Slot {
                    buf: vec![0; slot_size].into_boxed_slice(),
                    len: 0,
                })
                .collect(),
            oldest: 0,
            occupied: 0,
            out: Box::new(out),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots holding records that haven't been drained
    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    pub fn is_full(&self) -> bool {
        self.occupied == self.slots.len()
    }

    /// Claim the next free slot, or fail if every slot is occupied
    pub fn acquire_slot(&mut self) -> Result<SlotHandle> {
        if self.is_full() {
            return Err(Error::Capacity {
                capacity: self.capacity(),
            });
        }
        let index = (self.oldest + self.occupied) % self.slots.len();
        self.occupied += 1;
        Ok(SlotHandle { sink: self.id, index })
    }

    /// Render `format` with `args` into the slot, then surface the record.
    ///
    /// The record is truncated to fit the slot; rendering never writes past
    /// the slot's buffer. A handle acquired from another sink is rejected.
    pub fn format(&mut self, slot: SlotHandle, format: &str, args: &[TraceArg]) -> Result<()> {
        if slot.sink != self.id {
            return Err(Error::ForeignSlot { index: slot.index });
        }
        let slot = &mut self.slots[slot.index];
        slot.len = render_into(&mut slot.buf, format, args);
        let record = &slot.buf[.. slot.len];
        trace!("trace record: {}", String::from_utf8_lossy(record));
        self.out.write_all(record)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    /// Acquire a slot and render one record into it
    pub fn push(&mut self, format: &str, args: &[TraceArg]) -> Result<()> {
        let slot = self.acquire_slot()?;
        self.format(slot, format, args)
    }

    /// Remove and return the oldest record, freeing its slot
    pub fn pop_record(&mut self) -> Option<String> {
        if self.occupied == 0 {
            return None;
        }
        let text = self.slots[self.oldest].text();
        self.oldest = (self.oldest + 1) % self.slots.len();
        self.occupied -= 1;
        Some(text)
    }

    /// Remove and return every record, oldest first
    pub fn drain(&mut self) -> Vec<String> {
        std::iter::from_fn(|| self.pop_record()).collect()
    }
}

/// `fmt::Write` into a fixed buffer, keeping the last byte free and dropping
/// whatever doesn't fit. Never splits a UTF-8 character.
struct TruncatingWriter<'b> {
    buf: &'b mut [u8],
    len: usize,
}

impl<'b> fmt::Write for TruncatingWriter<'b> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len().saturating_sub(1).saturating_sub(self.len);
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len .. self.len + take].copy_from_slice(&s.as_bytes()[.. take]);
        self.len += take;
        Ok(())
    }
}

/// Render a printf-style `format` into `buf`, returning the rendered length.
///
/// Supports `%u` (integer), `%p` (pointer) and `%%`. Any other `%`
/// sequence is copied through as-is; a directive with no argument left
/// renders as `?`.
fn render_into(buf: &mut [u8], format: &str, args: &[TraceArg]) -> usize {
    let mut w = TruncatingWriter { buf, len: 0 };
    let mut args = args.iter();
    let mut chars = format.chars();
    // writes into a `TruncatingWriter` can't fail
    while let Some(c) = chars.next() {
        if c != '%' {
            let _ = w.write_char(c);
            continue;
        }
        let _ = match chars.next() {
            Some('u') => match args.next() {
                Some(TraceArg::Int(value)) => write!(w, "{}", value),
                Some(TraceArg::Ptr(addr)) => write!(w, "{}", addr),
                None => w.write_char('?'),
            },
            Some('p') => match args.next() {
                Some(TraceArg::Ptr(0)) | Some(TraceArg::Int(0)) => w.write_str("(nil)"),
                Some(TraceArg::Ptr(addr)) => write!(w, "{:#x}", addr),
                Some(TraceArg::Int(value)) => write!(w, "{:#x}", value),
                None => w.write_char('?'),
            },
            Some('%') => w.write_char('%'),
            Some(other) => w.write_char('%').and_then(|_| w.write_char(other)),
            None => w.write_char('%'),
        };
    }
    w.len
}

/// Render a record the way a slot of `slot_size` bytes would hold it
pub fn render(format: &str, args: &[TraceArg], slot_size: usize) -> String {
    let mut buf = vec![0; slot_size.max(1)];
    let len = render_into(&mut buf, format, args);
    String::from_utf8_lossy(&buf[.. len]).into_owned()
}

static SINK: OnceCell<Mutex<TraceSink>> = OnceCell::new();

/// Set up the process-wide sink with `capacity` slots, surfacing records on
/// stdout. Must be called exactly once, before any `track`.
pub fn init(capacity: usize) -> Result<()> {
    install(TraceSink::new(capacity))
}

/// Set up the process-wide sink with a caller-built `TraceSink`
pub fn install(sink: TraceSink) -> Result<()> {
    SINK.set(Mutex::new(sink)).map_err(|_| Error::AlreadyInitialized)
}

/// Push one record into the process-wide sink
pub fn try_track(format: &str, args: &[TraceArg]) -> Result<()> {
    let sink = SINK.get().ok_or(Error::NotInitialized)?;
    // the lock covers both acquiring and rendering, so no two threads ever
    // hold the same slot
    sink.lock().push(format, args)
}

/// The trace entry point: push one record into the process-wide sink,
/// terminating the process if that fails.
pub fn track(format: &str, args: &[TraceArg]) {
    if let Err(e) = try_track(format, args) {
        error!("Trace sink failure: {}", e);
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

/// Run `f` on the process-wide sink, e.g. to drain it
pub fn with_sink<R>(f: impl FnOnce(&mut TraceSink) -> R) -> Result<R> {
    let sink = SINK.get().ok_or(Error::NotInitialized)?;
    let mut guard = sink.lock();
    Ok(f(&mut guard))
}
