pub use priority_queue::{StablePriorityQueue, UniquePriorityQueue};

mod priority_queue;
