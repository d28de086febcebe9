// HTTP adapter for the agent-exec executor: route handlers and the DTO
// contract, exposed as a library so integration tests can mount the router.

pub mod models;
pub mod routes;
