pub mod gateway;
pub mod types;

pub use gateway::WorkflowGateway;
pub use types::{Deployment, HistoricProcessInstance, TypedVariable, VariableType, Variables, WorkflowTask};
