use armada_cluster::Cluster;

#[derive(Clone)]
pub struct AppState {
    pub cluster: Cluster,
}
