pub mod compiler;
pub mod model;
pub mod rules;

// Re-export main types for convenience
pub use compiler::{CompileOptions, CompiledRules, RejectedRule, compile};
pub use model::{
    ClusterwideNetworkPolicy, EgressRule, FqdnState, IngressRule, IpBlock, PolicyPort, Protocol,
    Service, ServicePort, ServiceType,
};
