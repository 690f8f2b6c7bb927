use super::*;
use crate::error::ToolError;
use crate::graph::{DependencyGraph, EdgeKind};
use crate::runner::{DryRunner, ShellRunner};
use crate::tool::{CommandLine, ToolOutputs, ToolRequest};
use serde_json::json;

/// Runner de prueba: anota cada comando en orden y simula fallas y salidas.
#[derive(Default)]
struct RecordingRunner {
    log: Mutex<Vec<String>>,
    failing: Vec<String>,
    outputs: HashMap<String, String>,
    shell: bool,
}

impl RecordingRunner {
    fn failing(mut self, command: &str) -> Self {
        self.failing.push(command.to_string());
        self
    }

    fn with_output(mut self, command: &str, stdout: &str) -> Self {
        self.outputs.insert(command.to_string(), stdout.to_string());
        self
    }

    fn executed(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, command: &str, capture: bool) -> CommandOutput {
        self.log.lock().unwrap().push(command.to_string());
        if self.shell {
            return ShellRunner.run(command, capture);
        }
        let exit_code = if self.failing.iter().any(|f| f == command) { 1 } else { 0 };
        let stdout = if capture {
            self.outputs.get(command).cloned().unwrap_or_default()
        } else {
            String::new()
        };
        CommandOutput { exit_code, stdout }
    }
}

fn engine_for(graph: &DependencyGraph, runner: Arc<dyn CommandRunner>) -> Engine {
    let topology = Topology::from_graph(graph).unwrap();
    Engine::new(Arc::new(topology), runner, EngineConfig { max_concurrency: 4 })
}

/* ===================== grafos de prueba ===================== */

fn linear_graph() -> DependencyGraph {
    let mut g = DependencyGraph::new();
    let s1 = g.add_stage_vertex("stage1", "compute1() > {}.out1");
    let out1 = g.add_or_get_data_vertex("out1");
    g.connect(s1, out1, EdgeKind::Produces, "");

    let s2 = g.add_stage_vertex("stage2", "compute2({}.out1) > {}.out2");
    let out2 = g.add_or_get_data_vertex("out2");
    g.connect(out1, s2, EdgeKind::Consumes, "");
    g.connect(s2, out2, EdgeKind::Produces, "");
    g
}

fn splitjoin_graph(count: &str, work: &str) -> DependencyGraph {
    let mut g = DependencyGraph::new();
    g.with_subgraph(|sg| {
        let split = sg.add_stage_vertex("split", "split {}");
        let chunk = sg.add_or_get_data_vertex("chunk");
        sg.connect(split, chunk, EdgeKind::FanOut, "");

        let stage = sg.add_stage_vertex("work", work);
        let done = sg.add_or_get_data_vertex("done");
        sg.connect(chunk, stage, EdgeKind::Consumes, "");
        sg.connect(stage, done, EdgeKind::Produces, "");

        let join = sg.add_stage_vertex("join", "merge @({}.##) > {}.all");
        let all = sg.add_or_get_data_vertex("all");
        sg.connect(done, join, EdgeKind::FanIn, "");
        sg.connect(join, all, EdgeKind::Produces, "");

        sg.add_count_vertex(count);
    });
    g
}

fn foo() -> RunTag {
    RunTag::new("foo", 0)
}

/* ===================== etapas de nivel superior ===================== */

#[tokio::test]
async fn escenario_de_punta_a_punta_respeta_dependencias() {
    let runner = Arc::new(RecordingRunner::default());
    let engine = engine_for(&linear_graph(), runner.clone());

    engine.run("foo", 0);
    let report = engine.wait().await;

    assert_eq!(
        runner.executed(),
        vec!["compute1() > foo.out1", "compute2(foo.out1) > foo.out2"]
    );
    assert!(report.is_clean());
    assert_eq!(report.commands_executed, 2);
    assert_eq!(engine.item("out2", foo()), Some(json!("")));
}

#[tokio::test]
async fn etapa_no_corre_hasta_tener_todas_sus_entradas() {
    let mut g = DependencyGraph::new();
    let s = g.add_stage_vertex("both", "both {}");
    let a = g.add_or_get_data_vertex("a");
    let b = g.add_or_get_data_vertex("b");
    g.connect(a, s, EdgeKind::Consumes, "");
    g.connect(b, s, EdgeKind::Consumes, "");

    let runner = Arc::new(RecordingRunner::default());
    let engine = engine_for(&g, runner.clone());

    engine.run("foo", 0);
    engine.input("foo", 0, "a", "x").unwrap();
    let report = engine.wait().await;
    assert!(runner.executed().is_empty());
    assert_eq!(report.stalled.len(), 1);
    assert_eq!(report.stalled[0].step, "both");
    assert_eq!(report.stalled[0].missing, vec!["b[foo#0]"]);

    engine.input("foo", 0, "b", "y").unwrap();
    let report = engine.wait().await;
    assert_eq!(runner.executed(), vec!["both foo"]);
    assert!(report.stalled.is_empty());
}

#[tokio::test]
async fn escritura_repetida_se_detecta_como_violacion() {
    let runner = Arc::new(RecordingRunner::default());
    let engine = engine_for(&linear_graph(), runner);

    engine.input("bar", 1, "out1", "v").unwrap();
    let err = engine.input("bar", 1, "out1", "w").unwrap_err();
    assert_eq!(err, StoreError::AlreadyWritten("out1[bar#1]".to_string()));

    let report = engine.wait().await;
    assert_eq!(report.violations.len(), 1);
    assert_eq!(engine.item("out1", RunTag::new("bar", 1)), Some(json!("v")));
}

#[tokio::test]
async fn input_con_etiqueta_desconocida_es_error() {
    let engine = engine_for(&linear_graph(), Arc::new(RecordingRunner::default()));
    assert_eq!(
        engine.input("foo", 0, "nada", "x"),
        Err(StoreError::UnknownCollection("nada".to_string()))
    );
}

#[tokio::test]
async fn corrida_repetida_se_ignora() {
    let runner = Arc::new(RecordingRunner::default());
    let engine = engine_for(&linear_graph(), runner.clone());

    engine.run("foo", 0);
    engine.run("foo", 0);
    engine.wait().await;
    assert_eq!(runner.executed().len(), 2);
}

#[tokio::test]
async fn falla_de_una_rama_no_afecta_a_las_hermanas() {
    let mut g = DependencyGraph::new();
    for (first, mid, last) in [("a", "x", "b"), ("c", "y", "d")] {
        let s1 = g.add_stage_vertex(first, &format!("{} {{}}", first));
        let data = g.add_or_get_data_vertex(mid);
        let s2 = g.add_stage_vertex(last, &format!("{} {{}}", last));
        g.connect(s1, data, EdgeKind::Produces, "");
        g.connect(data, s2, EdgeKind::Consumes, "");
    }

    let runner = Arc::new(RecordingRunner::default().failing("a foo"));
    let engine = engine_for(&g, runner.clone());
    engine.run("foo", 0);
    let report = engine.wait().await;

    let executed = runner.executed();
    assert!(executed.contains(&"c foo".to_string()));
    assert!(executed.contains(&"d foo".to_string()));
    assert!(!executed.contains(&"b foo".to_string()));
    assert_eq!(report.commands_failed, vec!["a foo"]);
    assert_eq!(report.stalled.len(), 1);
    assert_eq!(report.stalled[0].step, "b");
    assert_eq!(engine.item("x", foo()), None);
}

/* ===================== split-join ===================== */

#[tokio::test]
async fn fanout_con_count_3_crea_tres_chunks() {
    let runner = Arc::new(RecordingRunner::default().with_output("count foo", "3\n"));
    let engine = engine_for(&splitjoin_graph("count {}", "work {}.##"), runner.clone());

    engine.run("foo", 0);
    let report = engine.wait().await;
    assert!(report.is_clean(), "{:?}", report);

    for chunk in 0..3u32 {
        let tag = ChunkTag { chunk, run: foo() };
        assert_eq!(engine.item("splitjoin_1/chunk", tag.clone()), Some(json!(chunk)));
        assert!(engine.item("splitjoin_1/done", tag).is_some());
    }
    let fourth = ChunkTag { chunk: 3, run: foo() };
    assert_eq!(engine.item("splitjoin_1/chunk", fourth), None);
    assert_eq!(engine.item("splitjoin_1#count", foo()), Some(json!(3)));

    let executed = runner.executed();
    let mut work: Vec<&String> = executed.iter().filter(|c| c.starts_with("work")).collect();
    work.sort();
    assert_eq!(work, vec!["work foo.0", "work foo.1", "work foo.2"]);

    // el join corre último y con el arreglo desenrollado
    assert_eq!(
        executed.last().map(String::as_str),
        Some("merge foo.0 foo.1 foo.2 > foo.all")
    );
    assert_eq!(
        engine.splitjoin_phase("splitjoin_1", &foo()),
        Some(SplitJoinPhase::JoinComplete)
    );
    assert_eq!(engine.item("all", foo()), Some(json!("")));
}

#[tokio::test]
async fn fanin_espera_a_todos_los_chunks() {
    let runner = Arc::new(
        RecordingRunner::default()
            .with_output("count foo", "3")
            .failing("work foo.1"),
    );
    let engine = engine_for(&splitjoin_graph("count {}", "work {}.##"), runner.clone());

    engine.run("foo", 0);
    let report = engine.wait().await;

    assert!(!runner.executed().iter().any(|c| c.starts_with("merge")));
    assert_eq!(
        engine.splitjoin_phase("splitjoin_1", &foo()),
        Some(SplitJoinPhase::Dispatched { chunks: 3 })
    );
    assert_eq!(report.stalled.len(), 1);
    assert_eq!(report.stalled[0].step, "splitjoin_1.join");
    assert_eq!(report.stalled[0].missing, vec!["splitjoin_1/done[foo#0/1]"]);
    assert_eq!(engine.item("all", foo()), None);
}

fn two_lane_splitjoin_graph() -> DependencyGraph {
    let mut g = DependencyGraph::new();
    g.with_subgraph(|sg| {
        let split = sg.add_stage_vertex("split", "split {}");
        let c1 = sg.add_or_get_data_vertex("c1");
        let c2 = sg.add_or_get_data_vertex("c2");
        sg.connect(split, c1, EdgeKind::FanOut, "");
        sg.connect(split, c2, EdgeKind::FanOut, "");

        let w1 = sg.add_stage_vertex("w1", "w1 {}.##");
        let d1 = sg.add_or_get_data_vertex("d1");
        sg.connect(c1, w1, EdgeKind::Consumes, "");
        sg.connect(w1, d1, EdgeKind::Produces, "");

        let w2 = sg.add_stage_vertex("w2", "w2 {}.##");
        let d2 = sg.add_or_get_data_vertex("d2");
        sg.connect(c2, w2, EdgeKind::Consumes, "");
        sg.connect(w2, d2, EdgeKind::Produces, "");

        let join = sg.add_stage_vertex("join", "merge @({}.##) > {}.all");
        let all = sg.add_or_get_data_vertex("all");
        sg.connect(d1, join, EdgeKind::FanIn, "");
        sg.connect(d2, join, EdgeKind::FanIn, "");
        sg.connect(join, all, EdgeKind::Produces, "");

        sg.add_count_vertex("count {}");
    });
    g
}

#[tokio::test]
async fn dos_colecciones_de_fanout_y_fanin_por_chunk() {
    let runner = Arc::new(RecordingRunner::default().with_output("count foo", "3"));
    let engine = engine_for(&two_lane_splitjoin_graph(), runner.clone());

    engine.run("foo", 0);
    let report = engine.wait().await;
    assert!(report.is_clean(), "{:?}", report);

    for chunk in 0..3u32 {
        let tag = ChunkTag { chunk, run: foo() };
        for coll in ["c1", "c2"] {
            let name = format!("splitjoin_1/{}", coll);
            assert_eq!(engine.item(&name, tag.clone()), Some(json!(chunk)));
        }
        for coll in ["d1", "d2"] {
            let name = format!("splitjoin_1/{}", coll);
            assert!(engine.item(&name, tag.clone()).is_some());
        }
    }

    let executed = runner.executed();
    assert_eq!(executed.iter().filter(|c| c.starts_with('w')).count(), 6);
    assert_eq!(
        executed.last().map(String::as_str),
        Some("merge foo.0 foo.1 foo.2 > foo.all")
    );
}

#[tokio::test]
async fn join_espera_cada_coleccion_de_fanin() {
    let runner = Arc::new(
        RecordingRunner::default()
            .with_output("count foo", "3")
            .failing("w2 foo.2"),
    );
    let engine = engine_for(&two_lane_splitjoin_graph(), runner.clone());

    engine.run("foo", 0);
    let report = engine.wait().await;

    assert!(!runner.executed().iter().any(|c| c.starts_with("merge")));
    assert_eq!(report.stalled.len(), 1);
    assert_eq!(report.stalled[0].step, "splitjoin_1.join");
    assert_eq!(report.stalled[0].missing, vec!["splitjoin_1/d2[foo#0/2]"]);
    assert_eq!(engine.item("all", foo()), None);
}

#[tokio::test]
async fn count_invalido_deja_el_join_sin_ejecutar() {
    let runner = Arc::new(RecordingRunner::default().with_output("count foo", "muchos"));
    let engine = engine_for(&splitjoin_graph("count {}", "work {}.##"), runner.clone());

    engine.run("foo", 0);
    let report = engine.wait().await;

    assert_eq!(report.count_failures.len(), 1);
    assert!(report.commands_failed.is_empty());
    assert_eq!(
        engine.splitjoin_phase("splitjoin_1", &foo()),
        Some(SplitJoinPhase::CountPending)
    );
    assert_eq!(report.stalled[0].step, "splitjoin_1.join");
    assert!(!runner.executed().iter().any(|c| c.starts_with("work")));
}

#[tokio::test]
async fn count_cero_corre_el_join_con_arreglo_vacio() {
    let runner = Arc::new(RecordingRunner::default().with_output("count foo", "0"));
    let engine = engine_for(&splitjoin_graph("count {}", "work {}.##"), runner.clone());

    engine.run("foo", 0);
    let report = engine.wait().await;

    assert!(report.is_clean());
    assert_eq!(
        runner.executed(),
        vec!["split foo", "count foo", "merge  > foo.all"]
    );
}

#[tokio::test]
async fn split_fallido_no_hace_fanout() {
    let runner = Arc::new(RecordingRunner::default().failing("split foo"));
    let engine = engine_for(&splitjoin_graph("count {}", "work {}.##"), runner.clone());

    engine.run("foo", 0);
    engine.wait().await;

    assert_eq!(runner.executed(), vec!["split foo"]);
    assert_eq!(engine.splitjoin_phase("splitjoin_1", &foo()), None);
}

#[tokio::test]
async fn join_fallido_queda_registrado() {
    let runner = Arc::new(
        RecordingRunner::default()
            .with_output("count foo", "1")
            .failing("merge foo.0 > foo.all"),
    );
    let engine = engine_for(&splitjoin_graph("count {}", "work {}.##"), runner);

    engine.run("foo", 0);
    engine.wait().await;
    assert_eq!(
        engine.splitjoin_phase("splitjoin_1", &foo()),
        Some(SplitJoinPhase::JoinFailed)
    );
    assert_eq!(engine.item("all", foo()), None);
}

#[tokio::test]
async fn corridas_independientes_tienen_sus_propios_chunks() {
    let runner = Arc::new(
        RecordingRunner::default()
            .with_output("count s1", "2")
            .with_output("count s2", "1"),
    );
    let engine = engine_for(&splitjoin_graph("count {}", "work {}.##"), runner.clone());

    engine.run("s1", 0);
    engine.run("s2", 1);
    let report = engine.wait().await;
    assert!(report.is_clean());

    let executed = runner.executed();
    assert!(executed.contains(&"merge s1.0 s1.1 > s1.all".to_string()));
    assert!(executed.contains(&"merge s2.0 > s2.all".to_string()));
}

#[tokio::test]
async fn echo_4_en_shell_genera_cuatro_chunks_distintos() {
    let runner = Arc::new(RecordingRunner {
        shell: true,
        ..Default::default()
    });
    let mut g = DependencyGraph::new();
    g.with_subgraph(|sg| {
        let split = sg.add_stage_vertex("split", "true");
        let chunk = sg.add_or_get_data_vertex("chunk");
        sg.connect(split, chunk, EdgeKind::FanOut, "");

        let stage = sg.add_stage_vertex("work", "echo chunk_## > /dev/null");
        let done = sg.add_or_get_data_vertex("done");
        sg.connect(chunk, stage, EdgeKind::Consumes, "");
        sg.connect(stage, done, EdgeKind::Produces, "");

        let join = sg.add_stage_vertex("join", "true @(##)");
        sg.connect(done, join, EdgeKind::FanIn, "");
        sg.add_count_vertex("echo 4");
    });
    let engine = engine_for(&g, runner.clone());

    engine.run("sample", 0);
    let report = engine.wait().await;
    assert!(report.is_clean(), "{:?}", report);

    let mut chunks: Vec<String> = runner
        .executed()
        .into_iter()
        .filter(|c| c.starts_with("echo chunk_"))
        .collect();
    chunks.sort();
    assert_eq!(
        chunks,
        vec![
            "echo chunk_0 > /dev/null",
            "echo chunk_1 > /dev/null",
            "echo chunk_2 > /dev/null",
            "echo chunk_3 > /dev/null",
        ]
    );
    assert!(runner.executed().contains(&"true 0 1 2 3".to_string()));
}

#[tokio::test]
async fn dry_run_no_puede_contar_chunks() {
    let engine = engine_for(&splitjoin_graph("count {}", "work {}.##"), Arc::new(DryRunner));
    engine.run("foo", 0);
    let report = engine.wait().await;

    assert_eq!(report.count_failures.len(), 1);
    assert_eq!(
        engine.splitjoin_phase("splitjoin_1", &foo()),
        Some(SplitJoinPhase::CountPending)
    );
}

/* ===================== topología ===================== */

#[tokio::test]
async fn topologia_reconstruida_ejecuta_lo_mismo() {
    let graph = splitjoin_graph("count {}", "work {}.##");
    let bytes = serde_json::to_vec(&graph).unwrap();
    let mut decoded: DependencyGraph = serde_json::from_slice(&bytes).unwrap();
    decoded.reindex();

    assert_eq!(
        Topology::from_graph(&graph).unwrap(),
        Topology::from_graph(&decoded).unwrap()
    );

    let mut sets = Vec::new();
    for g in [&graph, &decoded] {
        let runner = Arc::new(RecordingRunner::default().with_output("count foo", "2"));
        let engine = engine_for(g, runner.clone());
        engine.run("foo", 0);
        engine.wait().await;
        let mut executed = runner.executed();
        executed.sort();
        sets.push(executed);
    }
    assert_eq!(sets[0], sets[1]);
}

/* ===================== modo CWL ===================== */

struct EchoResolver;

impl ToolResolver for EchoResolver {
    fn command_line(&self, request: &ToolRequest) -> Result<CommandLine, ToolError> {
        Ok(CommandLine {
            arguments: vec![json!("rev"), request.input_map["#rev.input"].clone()],
            stdin: None,
            stdout: None,
        })
    }

    fn outputs(&self, _request: &ToolRequest, _exit_code: i32) -> Result<ToolOutputs, ToolError> {
        let mut outputs = Map::new();
        outputs.insert("output".to_string(), json!({ "path": "out.txt" }));
        outputs.insert("extra".to_string(), json!(1));
        Ok(ToolOutputs {
            status: "SUCCESS".to_string(),
            outputs,
        })
    }
}

#[tokio::test]
async fn modo_cwl_liga_puertos_y_escribe_salidas_por_etapa() {
    let mut g = DependencyGraph::new();
    let step = g.add_stage_vertex("#rev", "{\"class\": \"CommandLineTool\"}");
    let input = g.add_or_get_data_vertex("#input");
    let output = g.add_or_get_data_vertex("#rev.output");
    g.connect(input, step, EdgeKind::Consumes, "#rev.input");
    g.connect(step, output, EdgeKind::Produces, "#rev.output");

    let runner = Arc::new(RecordingRunner::default());
    let engine = engine_for(&g, runner.clone()).with_tool_resolver(Arc::new(EchoResolver));

    engine.run("0", 0);
    engine.input("0", 0, "#input", "hola.txt").unwrap();
    let report = engine.wait().await;

    assert_eq!(runner.executed(), vec!["rev hola.txt"]);
    assert!(report.violations.is_empty());
    assert_eq!(
        engine.item("#rev.output", RunTag::new("0", 0)),
        Some(json!({ "path": "out.txt" }))
    );
    assert_eq!(engine.item("#rev.extra", RunTag::new("0", 0)), None);
}
