//! Weighted task partitioning
//!
//! Items with a scalar cost are packed greedily into blocks; small blocks are
//! merged into a single light block that the caller computes itself instead of
//! fanning it out.

use crate::error::{HazardError, Result};

/// Items with their total weight
#[derive(Debug, Clone, PartialEq)]
pub struct Block<T> {
    /// Items in insertion order
    pub items: Vec<T>,
    /// Sum of the item weights
    pub weight: f64,
}

impl<T> Default for Block<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            weight: 0.0,
        }
    }
}

impl<T> Block<T> {
    /// Append an item with its weight
    pub fn push(&mut self, item: T, weight: f64) {
        self.items.push(item);
        self.weight += weight;
    }

    /// Move every item of `other` into this block
    pub fn merge(&mut self, other: Block<T>) {
        self.items.extend(other.items);
        self.weight += other.weight;
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True without items
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Greedily pack items into blocks of at most `max_weight`.
///
/// A new block starts when adding the next item would exceed `max_weight`, so
/// an item heavier than `max_weight` ends up alone in its block. With `sort`
/// the items are first ordered by decreasing weight.
pub fn block_splitter<T, F>(
    items: impl IntoIterator<Item = T>,
    max_weight: f64,
    weight: F,
    sort: bool,
) -> Result<Vec<Block<T>>>
where
    F: Fn(&T) -> f64,
{
    if max_weight <= 0.0 || max_weight.is_nan() {
        return Err(HazardError::config(format!(
            "max_weight must be positive, got {max_weight}"
        )));
    }
    let mut weighted = items
        .into_iter()
        .map(|item| {
            let w = weight(&item);
            if w < 0.0 || w.is_nan() {
                return Err(HazardError::config(format!("invalid item weight {w}")));
            }
            Ok((w, item))
        })
        .collect::<Result<Vec<_>>>()?;
    if sort {
        weighted.sort_by(|a, b| b.0.total_cmp(&a.0));
    }
    let mut blocks = Vec::new();
    let mut current = Block::default();
    for (w, item) in weighted {
        if !current.is_empty() && current.weight + w > max_weight {
            blocks.push(std::mem::take(&mut current));
        }
        current.push(item, w);
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    Ok(blocks)
}

/// Blocks worth a task of their own, plus the merged remainder
#[derive(Debug, Clone, PartialEq)]
pub struct Split<T> {
    /// Blocks to submit as independent units of work
    pub heavy: Vec<Block<T>>,
    /// Items the caller processes without further fan-out
    pub light: Block<T>,
}

/// Separate heavy blocks from light ones.
///
/// The last block always goes to the light block, together with every block
/// lighter than `min_weight`.
pub fn split_heavy_light<T>(blocks: Vec<Block<T>>, min_weight: f64) -> Split<T> {
    let nblocks = blocks.len();
    let mut heavy = Vec::new();
    let mut light = Block::default();
    for (i, block) in blocks.into_iter().enumerate() {
        if i + 1 == nblocks || block.weight < min_weight {
            light.merge(block);
        } else {
            heavy.push(block);
        }
    }
    Split { heavy, light }
}

/// Pack items in blocks of `max_weight` and split them into heavy and light
pub fn partition<T, F>(
    items: impl IntoIterator<Item = T>,
    max_weight: f64,
    min_weight: f64,
    weight: F,
) -> Result<Split<T>>
where
    F: Fn(&T) -> f64,
{
    let blocks = block_splitter(items, max_weight, weight, false)?;
    Ok(split_heavy_light(blocks, min_weight))
}

/// Disaggregation cost of a rupture affecting `nsites` sites
pub fn disagg_weight(nsites: usize) -> f64 {
    (nsites as f64).sqrt()
}

/// Maximum block weight for disaggregation tasks
pub fn disagg_max_weight(total_weight: f64, concurrent_tasks: usize, ruptures_per_block: usize) -> f64 {
    let per_task = (total_weight / concurrent_tasks.max(1) as f64).ceil();
    per_task.min((ruptures_per_block * 100) as f64)
}
