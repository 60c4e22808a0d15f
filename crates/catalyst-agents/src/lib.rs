pub mod architect;
pub mod coder;
pub mod deployer;
pub mod planner;
pub mod reviewer;
pub mod tester;

pub use architect::Architect;
pub use coder::Coder;
pub use deployer::Deployer;
pub use planner::Planner;
pub use reviewer::Reviewer;
pub use tester::Tester;
