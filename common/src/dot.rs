use std::collections::BTreeMap;
use std::io::{self, Write};

use tracing::warn;

use crate::compiler::splitjoin_name;
use crate::graph::{DependencyGraph, EdgeKind, SubgraphId, Vertex, VertexId, VertexKind, ROOT_SUBGRAPH};

fn write_vertex<W: Write>(out: &mut W, id: VertexId, vertex: &Vertex) -> io::Result<()> {
    write!(out, "    {}", id.0)?;
    match vertex.kind {
        VertexKind::Stage => write!(
            out,
            "[label=\"{}\",style=\"filled\",color=\".7 .3 1.0\"]",
            vertex.name
        )?,
        VertexKind::DataDependency => {
            write!(out, "[label=\"{}\",shape=\"rectangle\"]", vertex.name)?
        }
        VertexKind::Count if vertex.subgraph == ROOT_SUBGRAPH => {
            warn!("se encontró un 'count' fuera de un splitjoin");
        }
        VertexKind::Count => write!(out, "[label=\"count\"]")?,
    }
    writeln!(out)
}

/// Escribe el grafo en formato GraphViz dot. Cada split-join va en su
/// propio cluster; las aristas de fan-in/fan-out se triplican.
pub fn write_graphviz<W: Write>(graph: &DependencyGraph, out: &mut W) -> io::Result<()> {
    writeln!(out, "digraph pipeline {{")?;

    for edge in graph.edges() {
        let (from, to) = (edge.from.0, edge.to.0);
        write!(out, "{}->{}", from, to)?;
        if !edge.port.is_empty() {
            write!(out, " [label=\"{}\"]", edge.port)?;
        }
        write!(out, ";")?;
        if matches!(edge.kind, EdgeKind::FanIn | EdgeKind::FanOut) {
            write!(out, "{}->{};{}->{};", from, to, from, to)?;
        }
        writeln!(out)?;
    }

    let mut clusters: BTreeMap<SubgraphId, Vec<(VertexId, &Vertex)>> = BTreeMap::new();
    for (id, vertex) in graph.vertices() {
        if vertex.subgraph == ROOT_SUBGRAPH {
            write_vertex(out, id, vertex)?;
        } else {
            clusters.entry(vertex.subgraph).or_default().push((id, vertex));
        }
    }

    for (subgraph, members) in clusters {
        writeln!(out, "  subgraph cluster_{} {{", splitjoin_name(subgraph))?;
        for (id, vertex) in members {
            write_vertex(out, id, vertex)?;
        }
        writeln!(out, "}}")?;
    }

    write!(out, "}}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_dot(graph: &DependencyGraph) -> String {
        let mut buf = Vec::new();
        write_graphviz(graph, &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn exporta_raiz_y_clusters() {
        let mut g = DependencyGraph::new();
        let s = g.add_stage_vertex("prep", "p");
        let d = g.add_or_get_data_vertex("input");
        g.connect(s, d, EdgeKind::Produces, "");
        g.with_subgraph(|sg| {
            let split = sg.add_stage_vertex("split", "s");
            let chunk = sg.add_or_get_data_vertex("chunk");
            sg.connect(split, chunk, EdgeKind::FanOut, "");
            sg.add_count_vertex("echo 2");
        });

        let dot = to_dot(&g);
        assert!(dot.starts_with("digraph pipeline {\n"));
        assert!(dot.contains("0->1;\n"));
        assert!(dot.contains("2->3;2->3;2->3;\n"));
        assert!(dot.contains("    0[label=\"prep\",style=\"filled\",color=\".7 .3 1.0\"]\n"));
        assert!(dot.contains("    1[label=\"input\",shape=\"rectangle\"]\n"));
        assert!(dot.contains("  subgraph cluster_splitjoin_1 {\n"));
        assert!(dot.contains("    4[label=\"count\"]\n"));
        assert!(dot.ends_with("}\n}"));
    }

    #[test]
    fn puertos_se_muestran_como_etiqueta() {
        let mut g = DependencyGraph::new();
        let s = g.add_stage_vertex("#rev", "{}");
        let d = g.add_or_get_data_vertex("#rev.output");
        g.connect(s, d, EdgeKind::Produces, "#rev.output");
        assert!(to_dot(&g).contains("0->1 [label=\"#rev.output\"];"));
    }
}
