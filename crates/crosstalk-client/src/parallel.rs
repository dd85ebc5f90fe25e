//! Result collector for parallel fan-out calls.

use crosstalk_wire::Payload;

use crate::call::CallReceiver;

/// Collects a fixed number of positionally indexed results.
///
/// Slots whose submission failed are written off up front by lowering the
/// expected count; slots whose call failed after submission stay `None`
/// when their completion arrives. Collection finishes once every surviving
/// call has completed, regardless of order.
pub(crate) struct ParallelResults<V> {
    values: Vec<Option<V>>,
    waiters: Vec<(usize, CallReceiver<V>)>,
    expected: usize,
}

impl<V: Payload> ParallelResults<V> {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            values: (0..size).map(|_| None).collect(),
            waiters: Vec::with_capacity(size),
            expected: size,
        }
    }

    /// Track a submitted call destined for `index`.
    pub(crate) fn attach(&mut self, index: usize, receiver: CallReceiver<V>) {
        self.waiters.push((index, receiver));
    }

    /// A call never made it onto a connection; expect one fewer result.
    pub(crate) fn submit_failed(&mut self) {
        self.expected -= 1;
    }

    #[cfg(test)]
    pub(crate) fn expected(&self) -> usize {
        self.expected
    }

    /// Wait for every surviving call and return the result array. Failed
    /// calls leave their slot `None`; this never errors.
    pub(crate) async fn collect(self) -> Vec<Option<V>> {
        let ParallelResults {
            mut values,
            waiters,
            expected,
        } = self;

        let mut completed = 0usize;
        for (index, receiver) in waiters {
            match receiver.await {
                Ok(Ok(value)) => values[index] = Some(value),
                Ok(Err(failure)) => {
                    tracing::debug!(index, failure = ?failure, "parallel call failed");
                }
                Err(_) => {
                    tracing::debug!(index, "parallel call abandoned");
                }
            }
            completed += 1;
        }
        debug_assert_eq!(completed, expected);
        values
    }
}
