use crate::err::Error;
use crate::operation::Operation;
use crate::types::Position;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, Zipf};

/// Generates benchmark operations whose positions follow a Zipf distribution.
///
/// Ranks drawn from the distribution are mapped through a shuffled index, so the popular positions
/// are scattered over the array instead of clustering at its start.
#[derive(Clone, Debug)]
pub struct OperationEngine {
    position_index: Vec<Position>,
    zipf: Zipf<f64>,
}

impl OperationEngine {
    /// `skew` is the Zipf exponent; zero gives a uniform distribution.
    pub fn new(element_num: usize, skew: f64, seed: u64) -> Result<Self, Error> {
        if element_num == 0 {
            return Err(Error::InvalidConfig("the element count must be at least 1"));
        }
        let zipf: Zipf<f64> = Zipf::new(element_num as f64, skew)
            .map_err(|_| Error::InvalidConfig("the skew must be a non-negative number"))?;

        let mut position_index: Vec<Position> = (0..element_num).collect();
        position_index.shuffle(&mut StdRng::seed_from_u64(seed));
        Ok(Self {
            position_index,
            zipf,
        })
    }

    /// Generate `n` operations of `arity` distinct, sorted positions each.
    pub fn generate(&self, n: usize, arity: usize, seed: u64) -> Result<Vec<Operation>, Error> {
        if arity == 0 || arity > self.position_index.len() {
            return Err(Error::InvalidConfig(
                "the arity must be between 1 and the element count",
            ));
        }

        let mut rng: StdRng = StdRng::seed_from_u64(seed);
        let operations: Vec<Operation> = (0..n)
            .map(|_| {
                let mut operation: Operation = Operation::with_capacity(arity);
                while operation.len() < arity {
                    // redraw until a position not yet in the operation comes up
                    operation.push_if_unique(self.sample(&mut rng));
                }
                operation.sort_targets();
                operation
            })
            .collect();
        Ok(operations)
    }

    fn sample(&self, rng: &mut StdRng) -> Position {
        // Zipf samples ranks from 1 to n as floats
        let rank: usize = self.zipf.sample(rng) as usize;
        let rank: usize = rank.clamp(1, self.position_index.len()) - 1;
        self.position_index[rank]
    }
}
