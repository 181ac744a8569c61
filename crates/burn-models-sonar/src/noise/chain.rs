//! Weighted mixes of noise items

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use super::custom::{CompositeNoise, GuidedNoise, RandomNoise, RepeatedNoise, ScheduledNoise};
use super::{NoiseParams, NoiseType, generate_values, standardize_items, validate_shape};
use crate::error::{Result, SonarError};

/// What a [`NoiseItem`] generates
#[derive(Debug, Clone, PartialEq)]
pub enum NoiseItemKind {
    /// A built-in generator
    Generator(NoiseType),
    Repeated(RepeatedNoise),
    Scheduled(ScheduledNoise),
    Random(RandomNoise),
    Composite(CompositeNoise),
    Guided(GuidedNoise),
}

impl NoiseItemKind {
    fn generate_values(
        &mut self,
        shape: [usize; 4],
        seed: u64,
        params: &NoiseParams,
    ) -> Result<Vec<f32>> {
        match self {
            NoiseItemKind::Generator(noise_type) => generate_values(shape, *noise_type, seed, params),
            NoiseItemKind::Repeated(repeated) => repeated.generate_values(shape, seed, params),
            NoiseItemKind::Scheduled(scheduled) => scheduled.generate_values(shape, seed, params),
            NoiseItemKind::Random(random) => random.generate_values(shape, seed, params),
            NoiseItemKind::Composite(composite) => composite.generate_values(shape, seed, params),
            NoiseItemKind::Guided(guided) => guided.generate_values(shape, seed, params),
        }
    }
}

/// One weighted entry in a [`NoiseChain`]
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseItem {
    pub kind: NoiseItemKind,
    pub factor: f32,
}

impl NoiseItem {
    pub fn new(kind: NoiseItemKind, factor: f32) -> Self {
        Self { kind, factor }
    }

    /// Item output, standardized per batch item, times `factor`
    pub(crate) fn contribution(
        &mut self,
        shape: [usize; 4],
        seed: u64,
        params: &NoiseParams,
    ) -> Result<Vec<f32>> {
        let mut values = self.kind.generate_values(shape, seed, params)?;
        standardize_items(&mut values, shape);
        for v in values.iter_mut() {
            *v *= self.factor;
        }
        Ok(values)
    }
}

/// Sum of normalized noise samples, each scaled by its own factor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoiseChain {
    items: Vec<NoiseItem>,
}

impl NoiseChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a generator; zero factors are dropped
    pub fn add(self, noise_type: NoiseType, factor: f32) -> Self {
        self.add_item(NoiseItemKind::Generator(noise_type), factor)
    }

    /// Appends any item kind; zero factors are dropped
    pub fn add_item(mut self, kind: NoiseItemKind, factor: f32) -> Self {
        if factor != 0.0 {
            self.items.push(NoiseItem::new(kind, factor));
        }
        self
    }

    /// Items in insertion order
    pub fn items(&self) -> &[NoiseItem] {
        &self.items
    }

    pub(crate) fn items_mut(&mut self) -> &mut [NoiseItem] {
        &mut self.items
    }

    /// Returns the number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if no items were added
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Rescales factors so their absolute values sum to `target`
    ///
    /// A target of 0 leaves the chain unchanged.
    pub fn rescaled(&self, target: f32) -> Self {
        let total: f32 = self.items.iter().map(|item| item.factor.abs()).sum();
        if target == 0.0 || total == 0.0 {
            return self.clone();
        }
        let scale = target / total;
        Self {
            items: self
                .items
                .iter()
                .map(|item| NoiseItem::new(item.kind.clone(), item.factor * scale))
                .collect(),
        }
    }

    /// Fills a flat buffer by summing each item's contribution
    ///
    /// Every item draws its own seed from a generator seeded with `seed`.
    /// Stateful items (repeated noise) advance their cache.
    pub fn generate_values(
        &mut self,
        shape: [usize; 4],
        seed: u64,
        params: &NoiseParams,
    ) -> Result<Vec<f32>> {
        validate_shape(shape)?;
        if self.items.is_empty() {
            return Err(SonarError::Configuration(
                "custom noise chain has no items".to_string(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut out = vec![0.0f32; shape.iter().product()];
        for item in self.items.iter_mut() {
            let values = item.contribution(shape, rng.next_u64(), params)?;
            for (acc, v) in out.iter_mut().zip(&values) {
                *acc += v;
            }
        }
        Ok(out)
    }
}
