//! Ordered scans over versioned heaps.
//!
//! A scan walks a conglomerate in its declared key order between
//! optional start and stop keys, filtering rows through a qualifier
//! matrix. Range operators are relative to the declared direction, so
//! "greater than" on a descending column means later in the scan, not
//! larger in value.
//!
//! The scan captures its snapshot when opened and keeps it for every
//! fetch. Rows deleted by the scan's own transaction vanish mid-scan;
//! fetching one by position reports a missing record.

use crate::conglomerate::ConglomerateDescriptor;
use crate::heap::{RecordKey, VersionedHeap};
use granite_common::prelude::*;
use granite_txn::{Snapshot, TxnStore};
use std::cmp::Ordering as CmpOrdering;
use std::ops::Bound;
use std::sync::Arc;

/// Position operator for scan boundary keys, interpreted in the
/// conglomerate's declared order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangeOp {
    /// At or after the key (for a start), before the key (for a stop)
    Ge,
    /// After the key (for a start), at or before the key (for a stop)
    Gt,
    /// No boundary
    #[default]
    Na,
}

/// Comparison operator for qualifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    IsNull,
    IsNotNull,
}

/// A restriction on one visible column. Comparisons involving null are
/// false; only the null tests match null.
#[derive(Debug, Clone)]
pub struct Qualifier {
    pub column: usize,
    pub op: CompareOp,
    pub value: Value,
}

impl Qualifier {
    pub fn new(column: usize, op: CompareOp, value: Value) -> Self {
        Self { column, op, value }
    }

    pub fn eq(column: usize, value: Value) -> Self {
        Self::new(column, CompareOp::Eq, value)
    }

    pub fn ne(column: usize, value: Value) -> Self {
        Self::new(column, CompareOp::Ne, value)
    }

    pub fn lt(column: usize, value: Value) -> Self {
        Self::new(column, CompareOp::Lt, value)
    }

    pub fn le(column: usize, value: Value) -> Self {
        Self::new(column, CompareOp::Le, value)
    }

    pub fn gt(column: usize, value: Value) -> Self {
        Self::new(column, CompareOp::Gt, value)
    }

    pub fn ge(column: usize, value: Value) -> Self {
        Self::new(column, CompareOp::Ge, value)
    }

    pub fn is_null(column: usize) -> Self {
        Self::new(column, CompareOp::IsNull, Value::Null)
    }

    pub fn is_not_null(column: usize) -> Self {
        Self::new(column, CompareOp::IsNotNull, Value::Null)
    }

    fn matches(&self, value: &Value) -> bool {
        match self.op {
            CompareOp::IsNull => matches!(value, Value::Null),
            CompareOp::IsNotNull => !matches!(value, Value::Null),
            _ if matches!(value, Value::Null) || matches!(self.value, Value::Null) => false,
            CompareOp::Eq => *value == self.value,
            CompareOp::Ne => *value != self.value,
            CompareOp::Lt => *value < self.value,
            CompareOp::Le => *value <= self.value,
            CompareOp::Gt => *value > self.value,
            CompareOp::Ge => *value >= self.value,
        }
    }
}

/// What a scan should visit. Built fluently; the default scans every
/// column of every row.
#[derive(Debug, Clone, Default)]
pub struct ScanSpec {
    /// Visible column indexes to project; empty means all columns
    pub projection: Vec<usize>,
    /// Leading key values bounding the start of the scan
    pub start_key: Vec<Value>,
    pub start_op: RangeOp,
    /// Leading key values bounding the end of the scan
    pub stop_key: Vec<Value>,
    pub stop_op: RangeOp,
    /// Conjunctive normal form filter: outer lists are ANDed, inner ORed
    pub qualifiers: Vec<Vec<Qualifier>>,
}

impl ScanSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project(mut self, columns: Vec<usize>) -> Self {
        self.projection = columns;
        self
    }

    pub fn from_key(mut self, key: Vec<Value>, op: RangeOp) -> Self {
        self.start_key = key;
        self.start_op = op;
        self
    }

    pub fn until_key(mut self, key: Vec<Value>, op: RangeOp) -> Self {
        self.stop_key = key;
        self.stop_op = op;
        self
    }

    pub fn filter(mut self, clause: Vec<Qualifier>) -> Self {
        self.qualifiers.push(clause);
        self
    }
}

/// Scan statistics.
#[derive(Debug, Clone, Default)]
pub struct ScanStats {
    pub rows_visited: u64,
    pub rows_qualified: u64,
    pub rows_filtered: u64,
    pub caller_rejections: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScanPosition {
    BeforeFirst,
    On(RecordKey),
    AfterLast,
}

/// Cursor over one conglomerate.
pub struct ScanController {
    heap: Arc<VersionedHeap>,
    store: Arc<TxnStore>,
    /// Descriptor as of open time; later structure changes do not retarget
    /// an open scan
    descriptor: ConglomerateDescriptor,
    txn: TxnId,
    snapshot: Snapshot,
    projection: Vec<usize>,
    spec: ScanSpec,
    /// Lowest address the start key can refer to, precomputed for seeks
    seek_floor: RecordKey,
    position: ScanPosition,
    closed: bool,
    stats: ScanStats,
}

impl ScanController {
    pub(crate) fn new(
        heap: Arc<VersionedHeap>,
        store: Arc<TxnStore>,
        descriptor: ConglomerateDescriptor,
        txn: TxnId,
        snapshot: Snapshot,
        spec: ScanSpec,
    ) -> Self {
        let projection = if spec.projection.is_empty() {
            (0..descriptor.column_count()).collect()
        } else {
            spec.projection.clone()
        };
        let seek_floor = RecordKey::floor(spec.start_key.clone(), descriptor.sort_orders());
        Self {
            heap,
            store,
            descriptor,
            txn,
            snapshot,
            projection,
            spec,
            seek_floor,
            position: ScanPosition::BeforeFirst,
            closed: false,
            stats: ScanStats::default(),
        }
    }

    pub fn conglomerate(&self) -> ConglomId {
        self.descriptor.id
    }

    pub fn txn(&self) -> TxnId {
        self.txn
    }

    /// Number of columns a full fetch produces.
    pub fn projected_width(&self) -> usize {
        self.projection.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(StoreError::ScanClosed.into());
        }
        Ok(())
    }

    fn orders(&self) -> &[SortOrder] {
        self.descriptor.sort_orders()
    }

    /// Whether a key lies past the stop boundary.
    fn past_stop(&self, key: &RecordKey) -> bool {
        match self.spec.stop_op {
            RangeOp::Na => false,
            RangeOp::Ge => key.prefix_cmp(&self.spec.stop_key, self.orders()) != CmpOrdering::Less,
            RangeOp::Gt => {
                key.prefix_cmp(&self.spec.stop_key, self.orders()) == CmpOrdering::Greater
            }
        }
    }

    /// Whether a key still sits inside the start boundary's equal run and
    /// must be skipped under a strict start.
    fn before_start(&self, key: &RecordKey) -> bool {
        self.spec.start_op == RangeOp::Gt
            && key.prefix_cmp(&self.spec.start_key, self.orders()) == CmpOrdering::Equal
    }

    fn row_qualifies(&self, row: &Row) -> Result<bool> {
        for clause in &self.spec.qualifiers {
            let mut any = false;
            for q in clause {
                let storage = self
                    .descriptor
                    .position_of(q.column)
                    .ok_or(StoreError::ColumnOutOfRange(q.column))?;
                let value = match row.values.get(storage) {
                    Some(v) => v.clone(),
                    None => self.descriptor.default_for(q.column),
                };
                if q.matches(&value) {
                    any = true;
                    break;
                }
            }
            if !any {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Advance to the next qualifying row. Returns false once the scan is
    /// exhausted.
    pub fn next(&mut self) -> Result<bool> {
        self.ensure_open()?;

        loop {
            let found = {
                let lower = match &self.position {
                    ScanPosition::BeforeFirst => match self.spec.start_op {
                        RangeOp::Na => Bound::Unbounded,
                        RangeOp::Ge | RangeOp::Gt => Bound::Included(&self.seek_floor),
                    },
                    ScanPosition::On(key) => Bound::Excluded(key),
                    ScanPosition::AfterLast => return Ok(false),
                };
                self.heap.next_visible(&self.store, &self.snapshot, lower)
            };

            let Some((key, row)) = found else {
                self.position = ScanPosition::AfterLast;
                return Ok(false);
            };
            self.stats.rows_visited += 1;

            if self.before_start(&key) {
                self.position = ScanPosition::On(key);
                continue;
            }
            if self.past_stop(&key) {
                self.position = ScanPosition::AfterLast;
                return Ok(false);
            }
            if self.row_qualifies(&row)? {
                self.stats.rows_qualified += 1;
                self.position = ScanPosition::On(key);
                return Ok(true);
            }
            self.stats.rows_filtered += 1;
            self.position = ScanPosition::On(key);
        }
    }

    fn positioned_key(&self) -> Result<&RecordKey> {
        match &self.position {
            ScanPosition::On(key) => Ok(key),
            _ => Err(Error::invalid_argument("scan is not positioned on a row")),
        }
    }

    /// Copy the projected columns of the current row into a caller
    /// buffer. The buffer's width selects a leftmost prefix of the
    /// projection; a full-width buffer receives every projected column.
    pub fn fetch(&self, out: &mut Row) -> Result<()> {
        self.ensure_open()?;
        let key = self.positioned_key()?;

        if out.values.len() > self.projection.len() {
            return Err(StoreError::ColumnOutOfRange(out.values.len()).into());
        }

        let row = self
            .heap
            .visible_row(&self.store, &self.snapshot, key)
            .ok_or(StoreError::RecordNotFound)?;

        for (slot, &logical) in out.values.iter_mut().zip(&self.projection) {
            let storage = self
                .descriptor
                .position_of(logical)
                .ok_or(StoreError::ColumnOutOfRange(logical))?;
            *slot = match row.values.get(storage) {
                Some(v) => v.clone(),
                // Rows written before an add-column lack the slot.
                None => self.descriptor.default_for(logical),
            };
        }
        Ok(())
    }

    /// Advance and fetch in one step.
    pub fn fetch_next(&mut self, out: &mut Row) -> Result<bool> {
        if !self.next()? {
            return Ok(false);
        }
        self.fetch(out)?;
        Ok(true)
    }

    /// Fill up to `max` caller slots with consecutive qualifying rows,
    /// reusing buffers already in `slots` and allocating only past the
    /// end. Returns the number of rows delivered.
    pub fn fetch_next_group(&mut self, slots: &mut Vec<Row>, max: usize) -> Result<usize> {
        self.ensure_open()?;
        let width = self.projection.len();
        let mut count = 0;

        while count < max && self.next()? {
            if slots.len() == count {
                slots.push(Row::new(vec![Value::Null; width]));
            } else if slots[count].values.len() != width {
                slots[count].values.resize(width, Value::Null);
            }
            self.fetch(&mut slots[count])?;
            count += 1;
        }
        Ok(count)
    }

    /// Re-evaluate the row under the cursor against the qualifiers using
    /// the latest committed state. A row another transaction has since
    /// deleted no longer qualifies.
    pub fn does_current_position_qualify(&self) -> Result<bool> {
        self.ensure_open()?;
        let key = self.positioned_key()?;

        let view = self.store.current_view(self.txn)?;
        match self.heap.visible_row(&self.store, &view, key) {
            Some(row) => self.row_qualifies(&row),
            None => Ok(false),
        }
    }

    /// Hint that the caller rejected the current row after its own
    /// re-qualification. Purely advisory.
    pub fn did_not_qualify(&mut self) {
        self.stats.caller_rejections += 1;
    }

    /// Reposition before the first row, keeping keys and qualifiers.
    pub fn reopen(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.position = ScanPosition::BeforeFirst;
        Ok(())
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.position = ScanPosition::AfterLast;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> ScanStats {
        self.stats.clone()
    }
}
