pub mod actions;
pub mod collaborators;
