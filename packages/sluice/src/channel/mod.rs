// implementation of sluice channels.
//
// the basic architecture is vaguely inspired by flume. it is as such:
//
// channel handles wrap around Arc<Shared<T>>, which holds Mutex<lockable state> plus the
//                                 |              immutable configuration
//          /----------------------/
//          v
//       lockable state
//          |
//          |------ it contains a queue::NestedQueue<T>, which is a not-itself-concurrent data
//          |       structure used to hold the buffered elements. values which are delayed or fed
//          |       from another channel reserve a nested queue at call time when delivery is by
//          |       call order, and fill it when they land.
//          |
//          |------ it contains a reader waiter queue:
//          |
//          |       this is a queue of keys each of which corresponds to a pending read future,
//          |       with a slot for storing a Waker. only the front reader may take an element,
//          |       which is used to achieve fairness.
//          |
//          |------ it contains a writer waiter queue, which is the same idea for writers waiting
//          |       out the backoff.
//          |
//          \------ it contains the binding (a consumer the output is delivered to), a ready hook
//                  (how an invocation learns its input changed), and weak references to peer
//                  channels which are aborted along with this one.
//
// blocking versions of operations are built as a layer on top of the futures, in the polling
// module.
//
// the organization of these modules is as such:
//
//      These are used like
//      library utilities:
//    /--------------------\
//
//      queue (crate)<---------core: This holds all state transitions. It is internal, and
//                   |         ^     expects its callers to uphold the API's rules.
//      waiters<-----/         |
//                             |
//      polling<---------------api: This is a wrapper around core that adapts it into an API that
//                                  is convenient and defensive. The crate re-exports this API
//                                  publically.

pub(crate) mod api;
pub(crate) mod core;

mod waiters;
mod polling;

pub use self::api::{
    channel,
    future::NextFut,
    Consumer,
    InputChannel,
    Iter,
    OutputChannel,
};
