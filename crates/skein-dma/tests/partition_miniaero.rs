//! Block-structured mesh face classification: cells grouped by block, faces
//! by the block of their left cell and then by boundary-condition type,
//! ghost cells as the image of block-border faces through the right cell.

use skein_base::{Event, EventTable, IndexSpace, Point, Rect};
use skein_dma::{
    AffineAccessor, FieldDataDescriptor, MemoryKind, MemoryStore, NodeId, PartitionEngine,
    RegionInstance,
};
use std::collections::HashSet;
use std::sync::Arc;

// 4 x 4 x 4 cells in 2 x 2 x 2 blocks
const GX: i64 = 4;
const GY: i64 = 4;
const GZ: i64 = 4;
const BX: i64 = 2;
const BY: i64 = 2;
const BZ: i64 = 2;
const N_BLOCKS: i64 = BX * BY * BZ;
const N_CELLS: i64 = GX * GY * GZ;

const BC_INTERIOR: i32 = 0;
const BC_TANGENT: i32 = 1;
const BC_EXTRAPOLATE: i32 = 2;
const BC_BLOCK_BORDER: i32 = 5;
const BC_TOTAL: i32 = 6;

fn split(total: i64, pieces: i64) -> Vec<i64> {
    (0..=pieces).map(|i| total * i / pieces).collect()
}

fn find_split(cuts: &[i64], v: i64) -> usize {
    for i in 1..cuts.len() {
        if v < cuts[i] {
            return i - 1;
        }
    }
    unreachable!("coordinate outside splits")
}

/// Global cell id under blocked ordering: blocks in z, y, x major order,
/// cells local to each block. Out-of-range coordinates return -1.
fn cell_pointer(xs: &[i64], ys: &[i64], zs: &[i64], cx: i64, cy: i64, cz: i64) -> i64 {
    if cx < 0 || cx >= GX || cy < 0 || cy >= GY || cz < 0 || cz >= GZ {
        return -1;
    }
    let mut p = 0;
    let zi = find_split(zs, cz);
    p += GX * GY * zs[zi];
    let lz = cz - zs[zi];
    let local_z = zs[zi + 1] - zs[zi];

    let yi = find_split(ys, cy);
    p += GX * ys[yi] * local_z;
    let ly = cy - ys[yi];
    let local_y = ys[yi + 1] - ys[yi];

    let xi = find_split(xs, cx);
    p += xs[xi] * local_y * local_z;
    let lx = cx - xs[xi];
    let local_x = xs[xi + 1] - xs[xi];

    p + lx + ly * local_x + lz * local_x * local_y
}

struct MeshData {
    n_faces: i64,
    cell_block: Vec<i32>,
    face_left: Vec<i64>,
    face_right: Vec<i64>,
    face_type: Vec<i32>,
}

/// Build blocked cells and the face list, x faces then y then z per block
fn build_mesh() -> MeshData {
    let xs = split(GX, BX);
    let ys = split(GY, BY);
    let zs = split(GZ, BZ);

    let mut cell_block = vec![0i32; N_CELLS as usize];
    let mut face_left = Vec::new();
    let mut face_right = Vec::new();
    let mut face_type = Vec::new();

    for blk in 0..N_BLOCKS {
        let bx = (blk % BX) as usize;
        let by = ((blk / BX) % BY) as usize;
        let bz = (blk / BX / BY) as usize;

        for cz in zs[bz]..zs[bz + 1] {
            for cy in ys[by]..ys[by + 1] {
                for cx in xs[bx]..xs[bx + 1] {
                    let p = cell_pointer(&xs, &ys, &zs, cx, cy, cz);
                    cell_block[p as usize] = blk as i32;
                }
            }
        }

        // x-normal faces
        for fx in xs[bx]..=xs[bx + 1] {
            let mut ftype = BC_INTERIOR;
            let mut reversed = false;
            if fx == xs[bx] {
                reversed = true;
                ftype = if fx == 0 { BC_EXTRAPOLATE } else { BC_BLOCK_BORDER };
            } else if fx == xs[bx + 1] {
                ftype = if fx == GX { BC_EXTRAPOLATE } else { BC_BLOCK_BORDER };
            }
            for cz in zs[bz]..zs[bz + 1] {
                for cy in ys[by]..ys[by + 1] {
                    let inner = if reversed { fx } else { fx - 1 };
                    let outer = if reversed { fx - 1 } else { fx };
                    face_left.push(cell_pointer(&xs, &ys, &zs, inner, cy, cz));
                    face_right.push(cell_pointer(&xs, &ys, &zs, outer, cy, cz));
                    face_type.push(ftype);
                }
            }
        }
        // y-normal faces
        for fy in ys[by]..=ys[by + 1] {
            let mut ftype = BC_INTERIOR;
            let mut reversed = false;
            if fy == ys[by] {
                reversed = true;
                ftype = if fy == 0 { BC_TANGENT } else { BC_BLOCK_BORDER };
            } else if fy == ys[by + 1] {
                ftype = if fy == GY { BC_TANGENT } else { BC_BLOCK_BORDER };
            }
            for cz in zs[bz]..zs[bz + 1] {
                for cx in xs[bx]..xs[bx + 1] {
                    let inner = if reversed { fy } else { fy - 1 };
                    let outer = if reversed { fy - 1 } else { fy };
                    face_left.push(cell_pointer(&xs, &ys, &zs, cx, inner, cz));
                    face_right.push(cell_pointer(&xs, &ys, &zs, cx, outer, cz));
                    face_type.push(ftype);
                }
            }
        }
        // z-normal faces
        for fz in zs[bz]..=zs[bz + 1] {
            let mut ftype = BC_INTERIOR;
            let mut reversed = false;
            if fz == zs[bz] {
                reversed = true;
                ftype = if fz == 0 { BC_TANGENT } else { BC_BLOCK_BORDER };
            } else if fz == zs[bz + 1] {
                ftype = if fz == GZ { BC_TANGENT } else { BC_BLOCK_BORDER };
            }
            for cy in ys[by]..ys[by + 1] {
                for cx in xs[bx]..xs[bx + 1] {
                    let inner = if reversed { fz } else { fz - 1 };
                    let outer = if reversed { fz - 1 } else { fz };
                    face_left.push(cell_pointer(&xs, &ys, &zs, cx, cy, inner));
                    face_right.push(cell_pointer(&xs, &ys, &zs, cx, cy, outer));
                    face_type.push(ftype);
                }
            }
        }
    }

    MeshData {
        n_faces: face_left.len() as i64,
        cell_block,
        face_left,
        face_right,
        face_type,
    }
}

#[test]
fn miniaero_face_classification_and_ghosts() {
    let mesh = build_mesh();
    // (gx+bx)*gy*gz per axis
    assert_eq!(mesh.n_faces, 3 * (GX + BX) * GY * GZ);

    let events = EventTable::new();
    let store = Arc::new(MemoryStore::new());
    let engine = PartitionEngine::new(Arc::clone(&events), Arc::clone(&store));
    let mem = store.create_memory(NodeId(0), MemoryKind::SystemLocal, 1 << 22);

    let is_cells = IndexSpace::dense(Rect::span(0, N_CELLS - 1));
    let is_faces = IndexSpace::dense(Rect::span(0, mesh.n_faces - 1));

    let ri_cells = RegionInstance::create(&store, mem, &is_cells, &[4]).unwrap();
    // left cell, right cell, boundary type
    let ri_faces = RegionInstance::create(&store, mem, &is_faces, &[8, 8, 4]).unwrap();

    let blockid = AffineAccessor::<i32, 1>::new(Arc::clone(&store), ri_cells.clone(), 0);
    for c in 0..N_CELLS {
        blockid.write(Point([c]), mesh.cell_block[c as usize]);
    }
    let left = AffineAccessor::<i64, 1>::new(Arc::clone(&store), ri_faces.clone(), 0);
    let right = AffineAccessor::<i64, 1>::new(Arc::clone(&store), ri_faces.clone(), 1);
    let ftype = AffineAccessor::<i32, 1>::new(Arc::clone(&store), ri_faces.clone(), 2);
    for f in 0..mesh.n_faces {
        left.write(Point([f]), mesh.face_left[f as usize]);
        right.write(Point([f]), mesh.face_right[f as usize]);
        ftype.write(Point([f]), mesh.face_type[f as usize]);
    }

    let blockid_fd = FieldDataDescriptor {
        space: is_cells.clone(),
        inst: ri_cells,
        field: 0,
    };
    let left_fd = FieldDataDescriptor {
        space: is_faces.clone(),
        inst: ri_faces.clone(),
        field: 0,
    };
    let right_fd = FieldDataDescriptor {
        space: is_faces.clone(),
        inst: ri_faces.clone(),
        field: 1,
    };
    let type_fd = FieldDataDescriptor {
        space: is_faces.clone(),
        inst: ri_faces,
        field: 2,
    };

    // cells by block
    let colors: Vec<i32> = (0..N_BLOCKS as i32).collect();
    let (p_cells, e1) = engine.by_field(&is_cells, vec![blockid_fd], colors, Event::NONE);

    // faces by the block of their left cell
    let (p_faces, e2) = engine.by_preimage(&is_faces, vec![left_fd], p_cells.clone(), e1);

    // each block's faces split by boundary type
    let ftcolors: Vec<i32> = (0..BC_TOTAL).collect();
    let mut p_facetypes = Vec::new();
    let mut border_faces = Vec::new();
    let mut type_events = Vec::new();
    for blk in 0..N_BLOCKS as usize {
        let (ft, e) = engine.by_field(&p_faces[blk], vec![type_fd.clone()], ftcolors.clone(), e2);
        border_faces.push(ft[BC_BLOCK_BORDER as usize].clone());
        p_facetypes.push(ft);
        type_events.push(e);
    }
    let e3 = events.merge(&type_events);

    // ghost cells: the image of just the border faces through the right cell
    let (p_ghost, e4) = engine.by_image(&is_cells, vec![right_fd], border_faces, e3);
    events.wait(e4).unwrap();

    // every block owns an equal brick of cells
    for (blk, pc) in p_cells.iter().enumerate() {
        assert_eq!(pc.volume() as i64, N_CELLS / N_BLOCKS, "cells of block {blk}");
    }
    // faces follow their left cell's block
    for (blk, pf) in p_faces.iter().enumerate() {
        assert_eq!(pf.volume() as i64, mesh.n_faces / N_BLOCKS, "faces of block {blk}");
    }

    // all faces between adjacent blocks classify as block border, and the
    // outer faces carry the domain boundary types
    for f in 0..mesh.n_faces {
        let l = mesh.face_left[f as usize];
        let r = mesh.face_right[f as usize];
        let lb = mesh.cell_block[l as usize];
        let expected = if r < 0 {
            // domain boundary: tangent except on the x faces
            assert!(matches!(
                mesh.face_type[f as usize],
                BC_TANGENT | BC_EXTRAPOLATE
            ));
            mesh.face_type[f as usize]
        } else {
            let rb = mesh.cell_block[r as usize];
            if lb != rb {
                BC_BLOCK_BORDER
            } else {
                BC_INTERIOR
            }
        };
        assert_eq!(mesh.face_type[f as usize], expected, "face {f} type");
        // the partition agrees with the raw field
        for blk in 0..N_BLOCKS as usize {
            for t in 0..BC_TOTAL as usize {
                let exp = blk as i32 == lb && t as i32 == expected;
                assert_eq!(
                    exp,
                    p_facetypes[blk][t].contains(Point([f])),
                    "face {f} in facetypes[{blk}][{t}]"
                );
            }
        }
    }

    // ghost cells of each block are exactly the cells whose face neighbor
    // lies in another block
    let mut expected_ghosts: Vec<HashSet<i64>> = vec![HashSet::new(); N_BLOCKS as usize];
    for f in 0..mesh.n_faces as usize {
        if mesh.face_type[f] == BC_BLOCK_BORDER {
            let owner = mesh.cell_block[mesh.face_left[f] as usize];
            expected_ghosts[owner as usize].insert(mesh.face_right[f]);
        }
    }
    for blk in 0..N_BLOCKS as usize {
        let actual: HashSet<i64> = p_ghost[blk].points().map(|p| p[0]).collect();
        assert_eq!(actual, expected_ghosts[blk], "ghosts of block {blk}");
        // ghosts never include the block's own cells
        for c in &actual {
            assert_ne!(mesh.cell_block[*c as usize], blk as i32);
        }
    }
}
