/*

```text
                               +--------+     +--------+
                               | Core   |<----+ Core   |   candidate branch a
          confirmed chain      +---+----+     +---+----+
  o----o----o----o----o <----------+              |
                        \                         |
                         \     +--------+         |
                          +----+ Core   |         |   candidate branch b
                               +--------+         |
                                                  v
                                        each core = one tentative block
                                        plus a forked view of the chain
```

A submitted block either extends the confirmed chain directly (empty fork
window) or becomes a core: one tentative block bound to a forked data
view layered on its parent. Cores form a tree anchored on the confirmed
tip; the main fork is elected deterministically and the window keeps every
branch bounded, promoting stabilized blocks into the confirmed chain.
*/

mod chain;
mod fork;
mod process;

pub use self::{
    chain::{ChainContext, Error},
    fork::{Admission, Core, ForkManager},
    process::Process,
};

pub type Result<T> = std::result::Result<T, Error>;
