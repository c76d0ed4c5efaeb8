use std::task::Waker;

/// Handle to a waker's slot in a [`WakerSet`]. Tokens are deliberately not
/// `Clone`; each belongs to exactly one waiting future.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Token(usize);

/// The wakers of every future waiting on one shared batch.
///
/// Only a single task needs to actually drive a batch (poll its window, then
/// its fetch). That task is the "driving waker": whichever waiter most
/// recently registered. The others sleep until the batch completes. If the
/// driver goes away, another waiter is promoted and woken, so that the batch
/// always has a path forward as long as anyone is still waiting on it.
#[derive(Debug, Default)]
pub(crate) struct WakerSet {
    // Slots are never reused; a batch's set of waiters is short-lived.
    wakers: Vec<Option<Waker>>,
    driver: Option<usize>,
}

impl WakerSet {
    /// Register the waker of a future that is about to return Pending. The
    /// first call for a given future allocates its token; later calls update
    /// the stored waker in place. Either way, the future becomes the driver,
    /// on the assumption that it has just polled the shared work.
    pub(crate) fn register(&mut self, token: &mut Option<Token>, waker: &Waker) {
        let index = self.store(token, waker);
        self.driver = Some(index);
    }

    /// Register the waker of a future that is waiting without having polled
    /// the shared work, because another waiter is polling it. The driver is
    /// left alone.
    pub(crate) fn register_waiter(&mut self, token: &mut Option<Token>, waker: &Waker) {
        self.store(token, waker);
    }

    fn store(&mut self, token: &mut Option<Token>, waker: &Waker) -> usize {
        match token {
            Some(Token(index)) => {
                let slot = &mut self.wakers[*index];
                if !matches!(slot, Some(stored) if stored.will_wake(waker)) {
                    *slot = Some(waker.clone());
                }
                *index
            }
            None => {
                let index = self.wakers.len();
                self.wakers.push(Some(waker.clone()));
                *token = Some(Token(index));
                index
            }
        }
    }

    /// Wake the current driver, if any. Used when the work became ready for
    /// reasons the driver couldn't have been notified about (such as the key
    /// limit being reached).
    pub(crate) fn wake_driver(&self) {
        if let Some(waker) = self.driver.and_then(|index| self.wakers[index].as_ref()) {
            waker.wake_by_ref();
        }
    }

    /// Remove a waker without notifying anyone. Only appropriate when the
    /// owning future is about to complete.
    pub(crate) fn discard(&mut self, token: Token) {
        self.wakers[token.0] = None;
        if self.driver == Some(token.0) {
            self.driver = None;
        }
    }

    /// Remove a waker. If it was the driver (or there is no driver), another
    /// waiter is promoted to driver and woken so that it takes over.
    pub(crate) fn discard_and_wake(&mut self, token: Token) {
        let index = token.0;
        self.wakers[index] = None;

        if self.driver == Some(index) || self.driver.is_none() {
            self.driver = self.wakers.iter().position(Option::is_some);
            self.wake_driver();
        }
    }

    /// Consume the set, waking every remaining waker.
    pub(crate) fn wake_all(self) {
        self.wakers.into_iter().flatten().for_each(Waker::wake);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::task::Wake;

    #[derive(Default)]
    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.wake_by_ref()
        }

        fn wake_by_ref(self: &Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> (Arc<CountingWaker>, Waker) {
        let counter = Arc::new(CountingWaker::default());
        let waker = Waker::from(counter.clone());
        (counter, waker)
    }

    fn count(counter: &CountingWaker) -> usize {
        counter.0.load(Ordering::SeqCst)
    }

    #[test]
    fn dropping_the_driver_promotes_another() {
        let (first, first_waker) = counting();
        let (second, second_waker) = counting();

        let mut set = WakerSet::default();
        let mut first_token = None;
        let mut second_token = None;

        set.register(&mut first_token, &first_waker);
        set.register(&mut second_token, &second_waker);

        // second is the driver; dropping it hands off to first
        set.discard_and_wake(second_token.take().unwrap());
        assert_eq!(count(&first), 1);
        assert_eq!(count(&second), 0);
    }

    #[test]
    fn dropping_a_follower_wakes_nobody() {
        let (first, first_waker) = counting();
        let (second, second_waker) = counting();

        let mut set = WakerSet::default();
        let mut first_token = None;
        let mut second_token = None;

        set.register(&mut first_token, &first_waker);
        set.register(&mut second_token, &second_waker);

        set.discard_and_wake(first_token.take().unwrap());
        assert_eq!(count(&first), 0);
        assert_eq!(count(&second), 0);
    }

    #[test]
    fn waiters_do_not_take_over_driving() {
        let (first, first_waker) = counting();
        let (second, second_waker) = counting();

        let mut set = WakerSet::default();
        let mut first_token = None;
        let mut second_token = None;

        set.register(&mut first_token, &first_waker);
        set.register_waiter(&mut second_token, &second_waker);

        set.wake_driver();
        assert_eq!(count(&first), 1);
        assert_eq!(count(&second), 0);
    }

    #[test]
    fn wake_all_skips_discarded() {
        let (first, first_waker) = counting();
        let (second, second_waker) = counting();

        let mut set = WakerSet::default();
        let mut first_token = None;
        let mut second_token = None;

        set.register(&mut first_token, &first_waker);
        set.register(&mut second_token, &second_waker);
        set.discard(second_token.take().unwrap());

        set.wake_all();
        assert_eq!(count(&first), 1);
        assert_eq!(count(&second), 0);
    }
}
