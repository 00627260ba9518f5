//! Per-symbol stream state
//!
//! Holds the symbol table and, per symbol, the minute-bar series built from
//! ticks and the latest buy/sell payout returns. Written by the router (and
//! the backfill path), read by consumers as deep-copied snapshots.
//!
//! Bar construction per tick:
//! - epoch exactly on a minute boundary: always append `(quote, epoch)`
//! - otherwise, if the boundary is newer than the tail bar: append
//!   `(quote, boundary)`
//! - otherwise: overwrite the tail close (last price wins)
//!
//! Lock order inside this module: table → quotes → proposals.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{info, trace};

use types::errors::FeedError;
use types::ids::Symbol;
use types::market::{is_minute_boundary, minute_boundary, Bar, ContractSide, ProposalPair};

/// Insertion-ordered symbol → dense index mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolTable {
    names: Vec<Symbol>,
    index: HashMap<Symbol, usize>,
}

impl SymbolTable {
    /// Build from a list; later duplicates are dropped.
    pub fn new(symbols: &[Symbol]) -> Self {
        let mut table = Self::default();
        for symbol in symbols {
            if !table.index.contains_key(symbol) {
                table.index.insert(symbol.clone(), table.names.len());
                table.names.push(symbol.clone());
            }
        }
        table
    }

    pub fn index_of(&self, symbol: &str) -> Option<usize> {
        self.index.get(symbol).copied()
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// What a tick did to a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Appended,
    Overwritten,
}

/// Minute bars for one symbol, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BarSeries {
    bars: Vec<Bar>,
}

impl BarSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bars(bars: Vec<Bar>) -> Self {
        Self { bars }
    }

    /// Fold one tick into the series.
    pub fn apply_tick(&mut self, quote: f64, epoch: i64) -> TickOutcome {
        if is_minute_boundary(epoch) {
            self.bars.push(Bar::new(quote, epoch));
            return TickOutcome::Appended;
        }

        let boundary = minute_boundary(epoch);
        match self.bars.last_mut() {
            Some(tail) if boundary > tail.open_time => {
                self.bars.push(Bar::new(quote, boundary));
                TickOutcome::Appended
            }
            Some(tail) => {
                tail.close = quote;
                TickOutcome::Overwritten
            }
            None => {
                self.bars.push(Bar::new(quote, boundary));
                TickOutcome::Appended
            }
        }
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

#[derive(Debug, Default)]
struct QuoteBook {
    series: Vec<BarSeries>,
    started: bool,
}

#[derive(Debug, Default)]
struct ProposalBook {
    pairs: Vec<ProposalPair>,
    started: bool,
}

/// Deep copy of every symbol's bar series.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteSnapshot {
    pub symbols: Vec<Symbol>,
    pub series: Vec<Vec<Bar>>,
}

impl QuoteSnapshot {
    pub fn bars_for(&self, symbol: &str) -> Option<&[Bar]> {
        let idx = self.symbols.iter().position(|s| s.as_str() == symbol)?;
        self.series.get(idx).map(Vec::as_slice)
    }
}

/// Deep copy of every symbol's payout returns.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalSnapshot {
    pub symbols: Vec<Symbol>,
    pub pairs: Vec<ProposalPair>,
}

impl ProposalSnapshot {
    pub fn pair_for(&self, symbol: &str) -> Option<ProposalPair> {
        let idx = self.symbols.iter().position(|s| s.as_str() == symbol)?;
        self.pairs.get(idx).copied()
    }
}

/// Symbol table plus per-symbol quote and proposal arrays.
#[derive(Debug, Default)]
pub struct SubscriptionState {
    table: RwLock<SymbolTable>,
    quotes: RwLock<QuoteBook>,
    proposals: RwLock<ProposalBook>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl SubscriptionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the symbol table and reset every array to empty.
    ///
    /// Both streams return to the not-started state.
    pub fn init_symbols(&self, symbols: &[Symbol]) {
        let mut table = write(&self.table);
        let mut quotes = write(&self.quotes);
        let mut proposals = write(&self.proposals);

        *table = SymbolTable::new(symbols);
        quotes.series = vec![BarSeries::new(); table.len()];
        quotes.started = false;
        proposals.pairs = vec![ProposalPair::default(); table.len()];
        proposals.started = false;

        info!(symbols = table.len(), "Symbol table initialized");
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        read(&self.table).symbols().to_vec()
    }

    pub fn index_of(&self, symbol: &str) -> Option<usize> {
        read(&self.table).index_of(symbol)
    }

    /// Apply a tick for `symbol`; `None` if the symbol is not in the table.
    pub fn apply_tick(&self, symbol: &str, quote: f64, epoch: i64) -> Option<TickOutcome> {
        let table = read(&self.table);
        let idx = table.index_of(symbol)?;
        let mut quotes = write(&self.quotes);
        let outcome = quotes.series.get_mut(idx)?.apply_tick(quote, epoch);
        trace!(symbol, quote, epoch, ?outcome, "Tick applied");
        Some(outcome)
    }

    /// Replace one symbol's series with backfilled bars.
    pub fn replace_series(&self, symbol: &str, bars: Vec<Bar>) -> Result<(), FeedError> {
        let table = read(&self.table);
        let idx = table
            .index_of(symbol)
            .ok_or_else(|| FeedError::UnknownSymbol {
                symbol: symbol.to_string(),
            })?;
        let mut quotes = write(&self.quotes);
        if let Some(series) = quotes.series.get_mut(idx) {
            *series = BarSeries::from_bars(bars);
        }
        Ok(())
    }

    pub fn mark_quotes_started(&self) {
        write(&self.quotes).started = true;
    }

    pub fn quotes_started(&self) -> bool {
        read(&self.quotes).started
    }

    /// Store one side of a proposal; `None` if the symbol is unknown.
    pub fn apply_proposal(&self, symbol: &str, side: ContractSide, value: f64) -> Option<()> {
        let table = read(&self.table);
        let idx = table.index_of(symbol)?;
        let mut proposals = write(&self.proposals);
        proposals.pairs.get_mut(idx)?.set(side, value);
        trace!(symbol, ?side, value, "Proposal applied");
        Some(())
    }

    pub fn mark_proposals_started(&self) {
        write(&self.proposals).started = true;
    }

    pub fn proposals_started(&self) -> bool {
        read(&self.proposals).started
    }

    /// Deep copy of the quote arrays; `NoInit` before the stream started.
    pub fn quote_snapshot(&self) -> Result<QuoteSnapshot, FeedError> {
        let table = read(&self.table);
        let quotes = read(&self.quotes);
        if !quotes.started {
            return Err(FeedError::NoInit);
        }
        Ok(QuoteSnapshot {
            symbols: table.symbols().to_vec(),
            series: quotes.series.iter().map(|s| s.bars().to_vec()).collect(),
        })
    }

    /// Deep copy of the proposal arrays; `NoInit` before the stream started.
    pub fn proposal_snapshot(&self) -> Result<ProposalSnapshot, FeedError> {
        let table = read(&self.table);
        let proposals = read(&self.proposals);
        if !proposals.started {
            return Err(FeedError::NoInit);
        }
        Ok(ProposalSnapshot {
            symbols: table.symbols().to_vec(),
            pairs: proposals.pairs.clone(),
        })
    }
}
