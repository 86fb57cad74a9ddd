pub mod daemon;
pub mod logging;
pub mod platform;
pub mod rpc;
pub mod settings;
pub mod swap;
pub mod tenant;

pub mod proto {
    pub mod boltzrpc {
        tonic::include_proto!("boltzrpc");
    }

    pub mod autoswaprpc {
        tonic::include_proto!("autoswaprpc");
    }
}
