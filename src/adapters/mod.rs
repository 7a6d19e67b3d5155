//! External collaborator clients
//!
//! The reconciler and pipeline talk to three off-chain services: the
//! indexer (subgraph) that derives transfer statuses, the third-party relay
//! service, and the meta-transaction gateway of the peer relayer network.
//! Each is a trait so the state machine and pipeline are testable without
//! the network.

pub mod messaging;
pub mod relay;
pub mod subgraph;

pub use messaging::{HttpMessaging, Messaging, MetaTxRequest};
pub use relay::{HttpRelayService, RelayRequest, RelayService};
pub use subgraph::{ContractReader, SubgraphClient};
