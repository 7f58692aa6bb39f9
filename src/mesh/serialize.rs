//! Binary formats: the `DNAV` tile layout (version 7) and the `MSET`
//! container holding a whole mesh. Everything is little-endian and tightly
//! packed; the 100-byte tile header is fixed.

use std::io::{self, Cursor, Read, Write};

use bevy::prelude::Vec3;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use super::{
    BvNode, NavMesh, NavMeshParams, OffMeshConnection, Poly, PolyDetail, PolyFlags, TileData,
};

pub const TILE_MAGIC: u32 =
    (b'D' as u32) << 24 | (b'N' as u32) << 16 | (b'A' as u32) << 8 | b'V' as u32;
pub const TILE_VERSION: u32 = 7;

pub const MESH_SET_MAGIC: u32 =
    (b'M' as u32) << 24 | (b'S' as u32) << 16 | (b'E' as u32) << 8 | b'T' as u32;
pub const MESH_SET_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum TileDecodeError {
    #[error("bad tile magic {0:#010x}")]
    WrongMagic(u32),
    #[error("unsupported tile format version {0}")]
    WrongVersion(u32),
    #[error("tile data is truncated or malformed")]
    Malformed(#[from] io::Error),
    #[error("tile section counts are inconsistent")]
    BadCounts,
}

impl PartialEq for TileDecodeError {
    fn eq(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Self::WrongMagic(_), Self::WrongMagic(_))
                | (Self::WrongVersion(_), Self::WrongVersion(_))
                | (Self::Malformed(_), Self::Malformed(_))
                | (Self::BadCounts, Self::BadCounts)
        )
    }
}
impl Eq for TileDecodeError {}

#[derive(Error, Debug)]
pub enum MeshSetDecodeError {
    #[error("bad mesh-set magic {0:#010x}")]
    WrongMagic(u32),
    #[error("unsupported mesh-set version {0}")]
    WrongVersion(u32),
    #[error("mesh-set data is truncated or malformed")]
    Malformed(#[from] io::Error),
    #[error(transparent)]
    Tile(#[from] TileDecodeError),
    #[error("mesh rejected a stored tile: {0}")]
    AddTile(#[from] super::AddTileError),
    #[error("stored init params are invalid: {0}")]
    Params(#[from] super::NavMeshError),
}

fn read_vec3(cursor: &mut Cursor<&[u8]>) -> io::Result<Vec3> {
    Ok(Vec3::new(
        cursor.read_f32::<LittleEndian>()?,
        cursor.read_f32::<LittleEndian>()?,
        cursor.read_f32::<LittleEndian>()?,
    ))
}

fn write_vec3(out: &mut Vec<u8>, v: Vec3) {
    out.write_f32::<LittleEndian>(v.x).unwrap();
    out.write_f32::<LittleEndian>(v.y).unwrap();
    out.write_f32::<LittleEndian>(v.z).unwrap();
}

impl TileData {
    /// Parses one tile from its serialized form.
    pub fn from_bytes(bytes: &[u8]) -> Result<TileData, TileDecodeError> {
        let mut cursor = Cursor::new(bytes);

        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != TILE_MAGIC {
            return Err(TileDecodeError::WrongMagic(magic));
        }
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != TILE_VERSION {
            return Err(TileDecodeError::WrongVersion(version));
        }

        let x = cursor.read_i32::<LittleEndian>()?;
        let y = cursor.read_i32::<LittleEndian>()?;
        let layer = cursor.read_i32::<LittleEndian>()?;
        let user_id = cursor.read_u32::<LittleEndian>()?;
        let poly_count = cursor.read_i32::<LittleEndian>()?;
        let vert_count = cursor.read_i32::<LittleEndian>()?;
        let max_link_count = cursor.read_i32::<LittleEndian>()?;
        let detail_mesh_count = cursor.read_i32::<LittleEndian>()?;
        let detail_vert_count = cursor.read_i32::<LittleEndian>()?;
        let detail_tri_count = cursor.read_i32::<LittleEndian>()?;
        let bv_node_count = cursor.read_i32::<LittleEndian>()?;
        let off_mesh_con_count = cursor.read_i32::<LittleEndian>()?;
        let off_mesh_base = cursor.read_i32::<LittleEndian>()?;
        let walkable_height = cursor.read_f32::<LittleEndian>()?;
        let walkable_radius = cursor.read_f32::<LittleEndian>()?;
        let walkable_climb = cursor.read_f32::<LittleEndian>()?;
        let bmin = read_vec3(&mut cursor)?;
        let bmax = read_vec3(&mut cursor)?;
        let bv_quant_factor = cursor.read_f32::<LittleEndian>()?;

        if poly_count < 0
            || vert_count < 0
            || max_link_count < 0
            || detail_mesh_count < 0
            || detail_vert_count < 0
            || detail_tri_count < 0
            || bv_node_count < 0
            || off_mesh_con_count < 0
            || off_mesh_base < 0
            || off_mesh_base + off_mesh_con_count != poly_count
        {
            return Err(TileDecodeError::BadCounts);
        }

        let mut vertices = Vec::with_capacity(vert_count as usize);
        for _ in 0..vert_count {
            vertices.push(read_vec3(&mut cursor)?);
        }

        let mut polys = Vec::with_capacity(poly_count as usize);
        for _ in 0..poly_count {
            let mut poly = Poly {
                first_link: cursor.read_u32::<LittleEndian>()?,
                ..Default::default()
            };
            for vertex in poly.vertices.iter_mut() {
                *vertex = cursor.read_u16::<LittleEndian>()?;
            }
            for neighbour in poly.neighbours.iter_mut() {
                *neighbour = cursor.read_u16::<LittleEndian>()?;
            }
            poly.flags = PolyFlags::from_bits_retain(cursor.read_u16::<LittleEndian>()?);
            poly.vertex_count = cursor.read_u8()?;
            poly.set_area_and_type_byte(cursor.read_u8()?);
            polys.push(poly);
        }

        // Links are runtime scratch; skip the stored records.
        cursor.set_position(cursor.position() + max_link_count as u64 * 12);

        let mut detail_meshes = Vec::with_capacity(detail_mesh_count as usize);
        for _ in 0..detail_mesh_count {
            let detail = PolyDetail {
                vert_base: cursor.read_u32::<LittleEndian>()?,
                tri_base: cursor.read_u32::<LittleEndian>()?,
                vert_count: cursor.read_u8()?,
                tri_count: cursor.read_u8()?,
            };
            cursor.read_u16::<LittleEndian>()?; // padding
            detail_meshes.push(detail);
        }

        let mut detail_vertices = Vec::with_capacity(detail_vert_count as usize);
        for _ in 0..detail_vert_count {
            detail_vertices.push(read_vec3(&mut cursor)?);
        }

        let mut detail_triangles = Vec::with_capacity(detail_tri_count as usize);
        for _ in 0..detail_tri_count {
            let mut triangle = [0u8; 4];
            cursor.read_exact(&mut triangle)?;
            detail_triangles.push(triangle);
        }

        let mut bv_nodes = Vec::with_capacity(bv_node_count as usize);
        for _ in 0..bv_node_count {
            let mut node = BvNode::default();
            for b in node.bmin.iter_mut() {
                *b = cursor.read_u16::<LittleEndian>()?;
            }
            for b in node.bmax.iter_mut() {
                *b = cursor.read_u16::<LittleEndian>()?;
            }
            node.i = cursor.read_i32::<LittleEndian>()?;
            bv_nodes.push(node);
        }

        let mut off_mesh_connections = Vec::with_capacity(off_mesh_con_count as usize);
        for _ in 0..off_mesh_con_count {
            let start = read_vec3(&mut cursor)?;
            let end = read_vec3(&mut cursor)?;
            off_mesh_connections.push(OffMeshConnection {
                endpoints: [start, end],
                radius: cursor.read_f32::<LittleEndian>()?,
                poly: cursor.read_u16::<LittleEndian>()?,
                flags: cursor.read_u8()?,
                side: cursor.read_u8()?,
                user_id: cursor.read_u32::<LittleEndian>()?,
            });
        }

        Ok(TileData {
            x,
            y,
            layer,
            user_id,
            bmin,
            bmax,
            walkable_height,
            walkable_radius,
            walkable_climb,
            bv_quant_factor,
            off_mesh_base: off_mesh_base as u32,
            max_link_count: max_link_count as u32,
            vertices,
            polys,
            detail_meshes,
            detail_vertices,
            detail_triangles,
            bv_nodes,
            off_mesh_connections,
        })
    }

    /// Serializes the tile. Inverse of [TileData::from_bytes].
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            100 + self.vertices.len() * 12
                + self.polys.len() * 32
                + self.max_link_count as usize * 12
                + self.detail_meshes.len() * 12
                + self.detail_vertices.len() * 12
                + self.detail_triangles.len() * 4
                + self.bv_nodes.len() * 16
                + self.off_mesh_connections.len() * 36,
        );

        out.write_u32::<LittleEndian>(TILE_MAGIC).unwrap();
        out.write_u32::<LittleEndian>(TILE_VERSION).unwrap();
        out.write_i32::<LittleEndian>(self.x).unwrap();
        out.write_i32::<LittleEndian>(self.y).unwrap();
        out.write_i32::<LittleEndian>(self.layer).unwrap();
        out.write_u32::<LittleEndian>(self.user_id).unwrap();
        out.write_i32::<LittleEndian>(self.polys.len() as i32).unwrap();
        out.write_i32::<LittleEndian>(self.vertices.len() as i32).unwrap();
        out.write_i32::<LittleEndian>(self.max_link_count as i32).unwrap();
        out.write_i32::<LittleEndian>(self.detail_meshes.len() as i32).unwrap();
        out.write_i32::<LittleEndian>(self.detail_vertices.len() as i32).unwrap();
        out.write_i32::<LittleEndian>(self.detail_triangles.len() as i32).unwrap();
        out.write_i32::<LittleEndian>(self.bv_nodes.len() as i32).unwrap();
        out.write_i32::<LittleEndian>(self.off_mesh_connections.len() as i32).unwrap();
        out.write_i32::<LittleEndian>(self.off_mesh_base as i32).unwrap();
        out.write_f32::<LittleEndian>(self.walkable_height).unwrap();
        out.write_f32::<LittleEndian>(self.walkable_radius).unwrap();
        out.write_f32::<LittleEndian>(self.walkable_climb).unwrap();
        write_vec3(&mut out, self.bmin);
        write_vec3(&mut out, self.bmax);
        out.write_f32::<LittleEndian>(self.bv_quant_factor).unwrap();

        debug_assert_eq!(out.len(), 100);

        for vertex in &self.vertices {
            write_vec3(&mut out, *vertex);
        }

        for poly in &self.polys {
            out.write_u32::<LittleEndian>(poly.first_link).unwrap();
            for vertex in poly.vertices {
                out.write_u16::<LittleEndian>(vertex).unwrap();
            }
            for neighbour in poly.neighbours {
                out.write_u16::<LittleEndian>(neighbour).unwrap();
            }
            out.write_u16::<LittleEndian>(poly.flags.bits()).unwrap();
            out.write_u8(poly.vertex_count).unwrap();
            out.write_u8(poly.area_and_type_byte()).unwrap();
        }

        // Scratch link records; rebuilt on add.
        out.extend(std::iter::repeat(0u8).take(self.max_link_count as usize * 12));

        for detail in &self.detail_meshes {
            out.write_u32::<LittleEndian>(detail.vert_base).unwrap();
            out.write_u32::<LittleEndian>(detail.tri_base).unwrap();
            out.write_u8(detail.vert_count).unwrap();
            out.write_u8(detail.tri_count).unwrap();
            out.write_u16::<LittleEndian>(0).unwrap();
        }

        for vertex in &self.detail_vertices {
            write_vec3(&mut out, *vertex);
        }

        for triangle in &self.detail_triangles {
            out.write_all(triangle).unwrap();
        }

        for node in &self.bv_nodes {
            for b in node.bmin {
                out.write_u16::<LittleEndian>(b).unwrap();
            }
            for b in node.bmax {
                out.write_u16::<LittleEndian>(b).unwrap();
            }
            out.write_i32::<LittleEndian>(node.i).unwrap();
        }

        for con in &self.off_mesh_connections {
            write_vec3(&mut out, con.endpoints[0]);
            write_vec3(&mut out, con.endpoints[1]);
            out.write_f32::<LittleEndian>(con.radius).unwrap();
            out.write_u16::<LittleEndian>(con.poly).unwrap();
            out.write_u8(con.flags).unwrap();
            out.write_u8(con.side).unwrap();
            out.write_u32::<LittleEndian>(con.user_id).unwrap();
        }

        out
    }
}

impl NavMesh {
    /// Serializes the whole mesh: init params followed by one record per
    /// loaded tile.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();

        out.write_u32::<LittleEndian>(MESH_SET_MAGIC).unwrap();
        out.write_u32::<LittleEndian>(MESH_SET_VERSION).unwrap();
        out.write_i32::<LittleEndian>(self.tiles().count() as i32).unwrap();

        let params = self.params();
        write_vec3(&mut out, params.origin);
        out.write_f32::<LittleEndian>(params.tile_width).unwrap();
        out.write_f32::<LittleEndian>(params.tile_height).unwrap();
        out.write_u32::<LittleEndian>(params.max_tiles).unwrap();
        out.write_u32::<LittleEndian>(params.max_polys).unwrap();

        for (slot, tile) in self.tiles() {
            let tile_bytes = tile.data.to_bytes();
            out.write_u32::<LittleEndian>(self.poly_ref_base(slot).0).unwrap();
            out.write_i32::<LittleEndian>(tile_bytes.len() as i32).unwrap();
            out.extend_from_slice(&tile_bytes);
        }

        out
    }

    /// Rebuilds a mesh from [NavMesh::to_bytes] output. Tile references are
    /// reassigned; query behavior is preserved.
    pub fn from_bytes(bytes: &[u8]) -> Result<NavMesh, MeshSetDecodeError> {
        let mut cursor = Cursor::new(bytes);

        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != MESH_SET_MAGIC {
            return Err(MeshSetDecodeError::WrongMagic(magic));
        }
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != MESH_SET_VERSION {
            return Err(MeshSetDecodeError::WrongVersion(version));
        }

        let tile_count = cursor.read_i32::<LittleEndian>()?;

        let origin = read_vec3(&mut cursor)?;
        let tile_width = cursor.read_f32::<LittleEndian>()?;
        let tile_height = cursor.read_f32::<LittleEndian>()?;
        let max_tiles = cursor.read_u32::<LittleEndian>()?;
        let max_polys = cursor.read_u32::<LittleEndian>()?;

        let mut mesh = NavMesh::new(NavMeshParams {
            origin,
            tile_width,
            tile_height,
            max_tiles,
            max_polys,
        })?;

        for _ in 0..tile_count {
            let _stored_ref = cursor.read_u32::<LittleEndian>()?;
            let data_size = cursor.read_i32::<LittleEndian>()?;

            let mut tile_bytes = vec![0u8; data_size as usize];
            cursor.read_exact(&mut tile_bytes)?;

            mesh.add_tile(TileData::from_bytes(&tile_bytes)?)?;
        }

        Ok(mesh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_magic() {
        let mut bytes = vec![0u8; 128];
        bytes[..4].copy_from_slice(&0xdeadbeefu32.to_le_bytes());

        assert!(matches!(
            TileData::from_bytes(&bytes),
            Err(TileDecodeError::WrongMagic(_))
        ));
    }

    #[test]
    fn rejects_wrong_version() {
        let mut bytes = vec![0u8; 128];
        bytes[..4].copy_from_slice(&TILE_MAGIC.to_le_bytes());
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());

        assert!(matches!(
            TileData::from_bytes(&bytes),
            Err(TileDecodeError::WrongVersion(99))
        ));
    }

    #[test]
    fn header_is_exactly_100_bytes() {
        let data = TileData {
            vertices: vec![Vec3::ZERO],
            polys: vec![Poly::default()],
            ..Default::default()
        };

        let bytes = data.to_bytes();
        // 100-byte header + one vertex + one polygon record.
        assert_eq!(bytes.len(), 100 + 12 + 32);
    }
}
