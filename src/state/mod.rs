pub mod conversation;
pub mod reconcile;
pub mod replay;
