tonic::include_proto!("syncweb");
