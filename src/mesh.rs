//! Grid → triangle strip mesh.

use std::fs;
use std::path::Path;

use log::info;

use crate::error::{LoadError, MeshError};
use crate::grid::{Grid, Vertex};

/// Immutable vertex/index data drawn with one indexed triangle-strip call.
#[derive(Clone, Debug, PartialEq)]
pub struct Mesh {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    rows: usize,
    cols: usize,
}

impl Mesh {
    /// Consumes the grid. Grids narrower than two columns cannot form a strip.
    pub fn from_grid(grid: Grid) -> Result<Self, MeshError> {
        let rows = grid.row_count();
        let cols = grid.col_count();
        if cols < 2 {
            return Err(MeshError::TooFewColumns { columns: cols });
        }

        Ok(Self {
            indices: build_strip_indices(rows, cols),
            vertices: grid.into_vertices(),
            rows,
            cols,
        })
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Centers the grid on the origin, scales elevations by `z_scale`, then
    /// scales uniformly so the longer side spans two world units.
    pub fn fit(&mut self, z_scale: f32) {
        let half_width = (self.cols - 1) as f32 / 2.0;
        let half_depth = (self.rows - 1) as f32 / 2.0;
        let extent = (self.cols - 1).max(self.rows - 1).max(1) as f32;
        let scale = 2.0 / extent;

        for vertex in &mut self.vertices {
            vertex.pos.x = (vertex.pos.x - half_width) * scale;
            vertex.pos.y = (vertex.pos.y - half_depth) * scale;
            vertex.pos.z *= z_scale * scale;
        }
    }
}

/// Reads, parses and fits a heightmap file.
pub fn load_mesh(path: &Path, z_scale: f32) -> Result<Mesh, LoadError> {
    let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let grid = Grid::parse(&text)?;
    info!(
        "Parsed {} ({} rows x {} columns).",
        path.display(),
        grid.row_count(),
        grid.col_count()
    );

    let mut mesh = Mesh::from_grid(grid)?;
    mesh.fit(z_scale);
    Ok(mesh)
}

/// Index sequence drawing a row-major `rows x cols` grid as one triangle strip.
///
/// Each pair of adjacent columns becomes a vertical strip. Strips are joined
/// with degenerate triangles: the top-left index of every strip after the
/// first is emitted twice, and the bottom-right index of every strip is
/// repeated once at its end.
///
/// # Panics
///
/// Panics if `cols < 2` or `rows == 0`.
pub fn build_strip_indices(rows: usize, cols: usize) -> Vec<u32> {
    assert!(cols >= 2, "a strip needs at least 2 columns, got {cols}");
    assert!(rows >= 1, "a strip needs at least 1 row");

    let mut indices = Vec::with_capacity(strip_index_count(rows, cols));
    for strip_start_col in 0..cols - 1 {
        let mut vert_index = strip_start_col;
        if strip_start_col != 0 {
            indices.push(vert_index as u32);
        }

        for _ in 0..rows {
            indices.push(vert_index as u32);
            indices.push((vert_index + 1) as u32);
            vert_index += cols;
        }

        indices.push((cols * (rows - 1) + strip_start_col + 1) as u32);
    }
    indices
}

/// `2 * rows` per strip, a leading degenerate on all but the first strip and
/// a trailing degenerate on every strip.
fn strip_index_count(rows: usize, cols: usize) -> usize {
    let strips = cols - 1;
    strips * 2 * rows + (strips - 1) + strips
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    #[test]
    fn two_by_three_fixture() {
        assert_eq!(
            build_strip_indices(2, 3),
            vec![0, 1, 3, 4, 4, 1, 1, 2, 4, 5, 5]
        );
    }

    #[rstest]
    #[case(1, 2)]
    #[case(2, 2)]
    #[case(3, 4)]
    #[case(10, 19)]
    #[case(1, 7)]
    fn index_count_formula(#[case] rows: usize, #[case] cols: usize) {
        let indices = build_strip_indices(rows, cols);
        assert_eq!(
            indices.len(),
            (cols - 1) * 2 * rows + (cols - 2) + (cols - 1)
        );
        assert!(indices.iter().all(|&i| (i as usize) < rows * cols));
    }

    #[test]
    #[should_panic(expected = "at least 2 columns")]
    fn single_column_is_a_programmer_error() {
        build_strip_indices(3, 1);
    }

    #[test]
    fn mesh_rejects_single_column_grid() {
        let grid = Grid::parse("1\n2\n3").unwrap();
        assert_eq!(
            Mesh::from_grid(grid).unwrap_err(),
            MeshError::TooFewColumns { columns: 1 }
        );
    }

    #[test]
    fn mesh_keeps_grid_vertices_in_order() {
        let grid = Grid::parse("0 1 2\n3 4 5").unwrap();
        let expected = grid.clone().into_vertices();
        let mesh = Mesh::from_grid(grid).unwrap();
        assert_eq!(mesh.vertices(), expected.as_slice());
        assert_eq!(mesh.indices(), build_strip_indices(2, 3).as_slice());
    }

    #[test]
    fn fit_centers_and_normalizes() {
        let grid = Grid::parse("0 0 0 0 0\n0 0 10 0 0\n0 0 0 0 0").unwrap();
        let mut mesh = Mesh::from_grid(grid).unwrap();
        mesh.fit(0.5);

        let first = mesh.vertices()[0].pos;
        assert_relative_eq!(first.x, -1.0);
        assert_relative_eq!(first.y, -0.5);

        let peak = mesh.vertices()[7].pos;
        assert_relative_eq!(peak.x, 0.0);
        assert_relative_eq!(peak.y, 0.0);
        assert_relative_eq!(peak.z, 2.5);

        let last = mesh.vertices()[14].pos;
        assert_relative_eq!(last.x, 1.0);
        assert_relative_eq!(last.y, 0.5);
    }

    #[test]
    fn negative_z_scale_flips_elevations() {
        let grid = Grid::parse("0 0 0\n0 8 0\n0 0 0").unwrap();
        let mut mesh = Mesh::from_grid(grid).unwrap();
        mesh.fit(-0.2);

        let peak = mesh.vertices()[4].pos;
        assert_relative_eq!(peak.x, 0.0);
        assert_relative_eq!(peak.y, 0.0);
        assert_relative_eq!(peak.z, -1.6);
        assert_relative_eq!(mesh.vertices()[0].pos.z, 0.0);
    }

    #[rstest]
    #[case("maps/pyramid.fdf", 7, 7)]
    #[case("maps/slope.fdf", 4, 9)]
    fn loads_bundled_maps(#[case] path: &str, #[case] rows: usize, #[case] cols: usize) {
        let mesh = load_mesh(Path::new(path), -0.2).unwrap();
        assert_eq!(mesh.vertices().len(), rows * cols);
        assert_eq!(mesh.indices(), build_strip_indices(rows, cols).as_slice());
        assert!(mesh
            .vertices()
            .iter()
            .all(|v| v.pos.x.abs() <= 1.0 && v.pos.y.abs() <= 1.0));
    }

    #[test]
    fn load_mesh_reports_missing_file() {
        let err = load_mesh(Path::new("does/not/exist.fdf"), 1.0).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }
}
