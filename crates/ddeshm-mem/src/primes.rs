//! Table capacities.
//!
//! Every capacity is prime and at least 8% away from the nearest power of
//! two; successive entries grow by roughly 1.5x.

/// Capacities a hash table may take, ascending.
pub const BEST_PRIMES: &[u32] = &[
    7, 13, 19, 29, 43, 71, 107, 157, 233, 349, 557, 839, 1259, 1889, 2833,
    4457, 6689, 10037, 15061, 22613, 35671, 53507, 80263, 120397, 180617,
    284957, 427439, 641167, 961757, 1442641, 2279527, 3419293, 5128943,
    7693417, 11540129, 18236129,
];

/// Returns the smallest table capacity `>= target`, or `None` past the end
/// of the table.
///
/// ```
/// use ddeshm_mem::primes::best_prime;
///
/// assert_eq!(best_prime(13), Some(13));
/// assert_eq!(best_prime(14), Some(19));
/// assert_eq!(best_prime(0), Some(7));
/// ```
#[must_use]
pub fn best_prime(target: u32) -> Option<u32> {
    let idx = BEST_PRIMES.partition_point(|&p| p < target);
    BEST_PRIMES.get(idx).copied()
}

/// Returns the capacity to grow to from `capacity` (about 1.5x).
#[must_use]
pub fn grown_capacity(capacity: u32) -> Option<u32> {
    best_prime(capacity.saturating_add(capacity / 2).max(capacity + 1))
}

/// Checks that `capacity` is one of [`BEST_PRIMES`].
#[must_use]
pub fn is_best_prime(capacity: u32) -> bool {
    BEST_PRIMES.binary_search(&capacity).is_ok()
}
