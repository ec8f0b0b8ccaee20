//! I/O modules for site polygons and imagery catalogs

pub mod polygons;
pub mod imagery;

pub use polygons::{PolygonStore, PolygonStoreConfig, TrainingPolygons};
pub use imagery::{ImageryQuery, InMemoryCatalog, QueryParams, Scene};
