/// Marcadores de las plantillas de comando.
pub const RUN_TAG_MARKER: &str = "{}";
pub const CHUNK_TAG_MARKER: &str = "##";
const CHUNK_ARRAY_OPEN: &str = "@(";
const CHUNK_ARRAY_CLOSE: char = ')';

/// Sustituye el nombre de la corrida (`{}`).
pub fn substitute_run_tag(command: &str, run_name: &str) -> String {
    command.replace(RUN_TAG_MARKER, run_name)
}

/// Sustituye el índice de chunk (`##`).
pub fn substitute_chunk_tag(command: &str, chunk: u32) -> String {
    command.replace(CHUNK_TAG_MARKER, &chunk.to_string())
}

/// Repite `fragment` `num_chunks` veces, cada copia con su índice, separadas por espacio.
pub fn unroll_chunks(fragment: &str, num_chunks: u32) -> String {
    (0..num_chunks)
        .map(|i| substitute_chunk_tag(fragment, i))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Rango (inicio, fin) del arreglo `@( ... )`: desde el primer `@(` hasta
/// el último `)`.
fn chunk_array_span(command: &str) -> Option<(usize, usize)> {
    let start = command.find(CHUNK_ARRAY_OPEN)?;
    let inner_start = start + CHUNK_ARRAY_OPEN.len();
    let end = command[inner_start..].rfind(CHUNK_ARRAY_CLOSE)? + inner_start;
    Some((start, end))
}

/// Extrae el contenido del arreglo `@( ... )`, o "" si no hay.
pub fn extract_chunk_array(command: &str) -> &str {
    match chunk_array_span(command) {
        Some((start, end)) => &command[start + CHUNK_ARRAY_OPEN.len()..end],
        None => "",
    }
}

/// Reemplaza `@( ... )` por el fragmento desenrollado `num_chunks` veces.
/// Si el comando no tiene arreglo se devuelve igual.
pub fn substitute_chunk_array(command: &str, num_chunks: u32) -> String {
    match chunk_array_span(command) {
        Some((start, end)) => {
            let fragment = &command[start + CHUNK_ARRAY_OPEN.len()..end];
            format!(
                "{}{}{}",
                &command[..start],
                unroll_chunks(fragment, num_chunks),
                &command[end + 1..]
            )
        }
        None => command.to_string(),
    }
}
