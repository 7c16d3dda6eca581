// queue of futures waiting on a channel.
//
// each pending future holds a key into this queue, and the fact that they form a queue is used to
// achieve fairness: only the front reader may take an element. it is not itself concurrent; it
// lives inside the channel's lockable state and is only touched with the channel locked.

use std::{collections::VecDeque, task::Waker};


#[derive(Debug, Default)]
pub(crate) struct Waiters {
    // key to hand out next.
    next_key: u64,
    // waiting futures in arrival order, with their most recent waker.
    queue: VecDeque<(u64, Option<Waker>)>,
}

impl Waiters {
    // construct empty.
    pub(crate) fn new() -> Self {
        Waiters::default()
    }

    // link a new waiter to the back and return its key.
    pub(crate) fn push(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        self.queue.push_back((key, None));
        key
    }

    // whether the waiter is still linked.
    #[cfg(test)]
    pub(crate) fn contains(&self, key: u64) -> bool {
        self.position(key).is_some()
    }

    // whether the waiter is at the front.
    pub(crate) fn is_front(&self, key: u64) -> bool {
        self.queue.front().is_some_and(|&(front, _)| front == key)
    }

    // install the waker for a linked waiter, replacing any previous one.
    pub(crate) fn set_waker(&mut self, key: u64, waker: &Waker) {
        if let Some(i) = self.position(key) {
            let slot = &mut self.queue[i].1;
            if !slot.as_ref().is_some_and(|old| old.will_wake(waker)) {
                *slot = Some(waker.clone());
            }
        }
    }

    // unlink a waiter, dropping its waker. returns whether it was at the front.
    pub(crate) fn remove(&mut self, key: u64) -> bool {
        match self.position(key) {
            Some(i) => {
                self.queue.remove(i);
                i == 0
            }
            None => false,
        }
    }

    // wake the front waiter, if any.
    pub(crate) fn wake_front(&mut self) {
        if let Some(waker) = self.queue.front_mut().and_then(|(_, waker)| waker.take()) {
            waker.wake();
        }
    }

    // wake all waiters. they stay linked.
    pub(crate) fn wake_all(&mut self) {
        for (_, waker) in self.queue.iter_mut() {
            if let Some(waker) = waker.take() {
                waker.wake();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    fn position(&self, key: u64) -> Option<usize> {
        // keys are handed out in increasing order and the queue stays sorted
        self.queue.binary_search_by_key(&key, |&(k, _)| k).ok()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{atomic::{AtomicUsize, Ordering}, Arc},
        task::Wake,
    };

    struct Count(AtomicUsize);

    impl Wake for Count {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn fifo_front_and_wake() {
        let count = Arc::new(Count(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&count));
        let mut waiters = Waiters::new();
        let a = waiters.push();
        let b = waiters.push();
        let c = waiters.push();
        assert!(waiters.is_front(a));
        assert!(!waiters.is_front(b));
        waiters.set_waker(a, &waker);
        waiters.set_waker(c, &waker);

        waiters.wake_front();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        // waker was consumed
        waiters.wake_front();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);

        assert!(!waiters.remove(b));
        assert!(waiters.remove(a));
        assert!(!waiters.remove(a));
        assert!(waiters.is_front(c));
        assert!(!waiters.contains(b));
        waiters.wake_all();
        assert_eq!(count.0.load(Ordering::SeqCst), 2);
        assert_eq!(waiters.len(), 1);
    }
}
