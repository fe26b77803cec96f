//! Generated protobuf modules
//!
//! `build.rs` compiles every `.proto` file under `$MESHTASTIC_PROTO_DIR`
//! (default: `protos/`) with `prost-build`. When no protos are staged there
//! it falls back to a placeholder so the crate still builds; point
//! `MESHTASTIC_PROTO_DIR` at a checkout of the Meshtastic `protobufs` repo to
//! get the real wire types.

pub mod meshtastic_generated {
    //! Generated Meshtastic protobuf types.
    //! All Meshtastic protos share the `meshtastic` package, so prost emits
    //! a single `meshtastic.rs` file containing every definition the manager
    //! needs: `FromRadio`, `ToRadio`, `MeshPacket`, `NodeInfo`, `Config`,
    //! `ModuleConfig`, `Position`, `Telemetry`, `Routing`, `AdminMessage`,
    //! `NeighborInfo`, `Traceroute`, `Channel`, `User`.
    include!(concat!(env!("OUT_DIR"), "/meshtastic.rs"));
}
