pub mod cargolist;
pub mod goods;
pub mod id;
pub mod linkgraph;
pub mod packet;
pub mod serialize;
pub mod settings;
pub mod station;
pub mod world;
