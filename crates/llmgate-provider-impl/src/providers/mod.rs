mod gateway;

pub use gateway::GatewayProvider;
